use std::{
    fs,
    path::{Path, PathBuf},
};

use itertools::Itertools;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    error::{RfError, RfResult},
    types::{HashMap, HashSet, UnitId},
};

const SESSION_DIR_PREFIX: &str = "ses-";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpikeRecord {
    pub unit_id: UnitId,
    pub brain_area: String,
    pub spike_time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StimulusPresentation {
    pub start_time: f64,
    pub stop_time: f64,
    #[serde(default)]
    pub x_position: Option<f64>,
    #[serde(default)]
    pub y_position: Option<f64>,
    #[serde(default)]
    pub orientation: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpikeObservation {
    pub unit_id: UnitId,
    pub brain_area: String,
    pub x_position: f64,
    pub y_position: f64,
    #[serde(default)]
    pub orientation: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlignedSpike {
    pub unit_id: UnitId,
    pub brain_area: String,
    pub spike_time: f64,
    pub stimulus_idx: usize,
    pub relative_time: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StimulusKind {
    Flash,
    Gabor,
}

impl StimulusKind {
    fn file_prefix(&self) -> &'static str {
        match self {
            StimulusKind::Flash => "flash",
            StimulusKind::Gabor => "gabor",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub spikes: Vec<SpikeRecord>,
    pub stimuli: Vec<StimulusPresentation>,
}

impl Session {
    pub fn new(
        session_id: &str,
        spikes: Vec<SpikeRecord>,
        mut stimuli: Vec<StimulusPresentation>,
    ) -> Self {
        stimuli.sort_by(|a, b| a.start_time.total_cmp(&b.start_time));

        Self {
            session_id: session_id.to_string(),
            spikes,
            stimuli,
        }
    }

    pub fn brain_areas(&self) -> Vec<String> {
        self.spikes
            .iter()
            .map(|spike| spike.brain_area.clone())
            .unique()
            .collect()
    }
}

pub fn available_sessions(data_dir: impl AsRef<Path>) -> RfResult<Vec<String>> {
    let mut session_ids = Vec::new();

    for entry in fs::read_dir(data_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }

        if let Some(session_id) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.strip_prefix(SESSION_DIR_PREFIX))
        {
            session_ids.push(session_id.to_string());
        }
    }

    session_ids.sort();
    Ok(session_ids)
}

pub fn load_session(
    data_dir: impl AsRef<Path>,
    session_id: &str,
    stimulus_kind: StimulusKind,
) -> RfResult<Session> {
    let data_dir = data_dir.as_ref();
    let session_dir = data_dir.join(format!("{}{}", SESSION_DIR_PREFIX, session_id));

    if !session_dir.is_dir() {
        return Err(RfError::SessionNotFound {
            session_id: session_id.to_string(),
            available: available_sessions(data_dir)?,
        });
    }

    let prefix = stimulus_kind.file_prefix();
    let spikes: Vec<SpikeRecord> = read_table(session_dir.join(format!("{}_spikes.json", prefix)))?;
    let stimuli: Vec<StimulusPresentation> =
        read_table(session_dir.join(format!("{}_stimuli.json", prefix)))?;

    log::info!(
        "loaded session {}: {} spikes, {} stimulus presentations",
        session_id,
        spikes.len(),
        stimuli.len()
    );

    Ok(Session::new(session_id, spikes, stimuli))
}

fn read_table<T: DeserializeOwned>(path: PathBuf) -> RfResult<Vec<T>> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

pub fn select_brain_area(spikes: &[SpikeRecord], brain_area: &str) -> RfResult<Vec<SpikeRecord>> {
    let requested = brain_area.to_uppercase();
    let available: Vec<String> = spikes
        .iter()
        .map(|spike| spike.brain_area.clone())
        .unique()
        .collect();

    if !available.contains(&requested) {
        return Err(RfError::UnknownBrainArea {
            requested,
            available,
        });
    }

    Ok(spikes
        .iter()
        .filter(|spike| spike.brain_area == requested)
        .cloned()
        .collect())
}

pub fn select_spikes_around_stimuli(
    spikes: &[SpikeRecord],
    stimuli: &[StimulusPresentation],
    tmin: f64,
    tmax: f64,
) -> Vec<SpikeRecord> {
    let start_times = sorted_start_times(stimuli);

    spikes
        .iter()
        .filter(|spike| {
            // all windows have the same length, so the latest eligible start ends last
            let idx = start_times.partition_point(|start| start + tmin <= spike.spike_time);
            idx > 0 && spike.spike_time < start_times[idx - 1] + tmax
        })
        .cloned()
        .collect()
}

pub fn clip_spikes(spikes: &[SpikeRecord], max_duration: f64) -> Vec<SpikeRecord> {
    let Some(t_first) = spike_time_range(spikes).map(|(t_min, _)| t_min) else {
        return Vec::new();
    };

    let t_stop = t_first + max_duration;

    spikes
        .iter()
        .filter(|spike| spike.spike_time <= t_stop)
        .cloned()
        .collect()
}

pub fn align_to_stimuli(
    spikes: &[SpikeRecord],
    stimuli: &[StimulusPresentation],
    window_offset: f64,
) -> Vec<AlignedSpike> {
    let order = stimulus_order(stimuli);
    let window_starts: Vec<f64> = order
        .iter()
        .map(|&idx| stimuli[idx].start_time - window_offset)
        .collect();

    spikes
        .iter()
        .filter_map(|spike| {
            let pos = window_starts.partition_point(|start| *start <= spike.spike_time);
            if pos == 0 {
                return None;
            }

            let stimulus_idx = order[pos - 1];

            Some(AlignedSpike {
                unit_id: spike.unit_id,
                brain_area: spike.brain_area.clone(),
                spike_time: spike.spike_time,
                stimulus_idx,
                relative_time: spike.spike_time - stimuli[stimulus_idx].start_time,
            })
        })
        .collect()
}

pub fn attribute_to_positions(
    spikes: &[SpikeRecord],
    stimuli: &[StimulusPresentation],
) -> Vec<SpikeObservation> {
    let order = stimulus_order(stimuli);
    let start_times: Vec<f64> = order.iter().map(|&idx| stimuli[idx].start_time).collect();

    spikes
        .iter()
        .filter_map(|spike| {
            let pos = start_times.partition_point(|start| *start <= spike.spike_time);
            if pos == 0 {
                return None;
            }

            let stimulus = &stimuli[order[pos - 1]];
            if spike.spike_time >= stimulus.stop_time {
                return None;
            }

            Some(SpikeObservation {
                unit_id: spike.unit_id,
                brain_area: spike.brain_area.clone(),
                x_position: stimulus.x_position?,
                y_position: stimulus.y_position?,
                orientation: stimulus.orientation,
            })
        })
        .collect()
}

pub fn spike_counts_per_unit(spikes: &[SpikeRecord]) -> Vec<(UnitId, usize)> {
    let mut counts: HashMap<UnitId, usize> = HashMap::default();

    for spike in spikes {
        *counts.entry(spike.unit_id).or_insert(0) += 1;
    }

    counts.into_iter().sorted().collect()
}

pub fn units_per_brain_area(spikes: &[SpikeRecord]) -> Vec<(String, usize)> {
    let mut units: HashMap<&str, HashSet<UnitId>> = HashMap::default();

    for spike in spikes {
        units
            .entry(spike.brain_area.as_str())
            .or_default()
            .insert(spike.unit_id);
    }

    units
        .into_iter()
        .map(|(brain_area, unit_ids)| (brain_area.to_string(), unit_ids.len()))
        .sorted()
        .collect()
}

pub fn spike_time_range(spikes: &[SpikeRecord]) -> Option<(f64, f64)> {
    spikes.iter().map(|spike| spike.spike_time).fold(None, |range, t| match range {
        None => Some((t, t)),
        Some((t_min, t_max)) => Some((t_min.min(t), t_max.max(t))),
    })
}

fn sorted_start_times(stimuli: &[StimulusPresentation]) -> Vec<f64> {
    stimuli
        .iter()
        .map(|stimulus| stimulus.start_time)
        .sorted_by(|a, b| a.total_cmp(b))
        .collect()
}

fn stimulus_order(stimuli: &[StimulusPresentation]) -> Vec<usize> {
    (0..stimuli.len())
        .sorted_by(|&a, &b| stimuli[a].start_time.total_cmp(&stimuli[b].start_time))
        .collect()
}
