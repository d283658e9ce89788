use itertools::Itertools;
use simple_error::try_with;

use crate::{
    error::RfResult,
    params::{validate_selection_params, SelectionParams},
    session::{self, Session, SpikeRecord},
    types::{HashMap, UnitId},
};

#[derive(Debug, Clone, PartialEq)]
pub struct SpikeTrain {
    pub unit_id: UnitId,
    pub brain_area: String,
    pub times: Vec<f64>,
    pub t_start: f64,
    pub t_stop: f64,
}

impl SpikeTrain {
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn duration(&self) -> f64 {
        self.t_stop - self.t_start
    }

    pub fn mean_rate(&self) -> f64 {
        self.len() as f64 / self.duration()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SynchronousSpikes {
    pub times: Vec<f64>,
    pub train_indices: Vec<usize>,
}

impl SynchronousSpikes {
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }
}

// all trains share one window, padded by a second on both sides
pub fn spikes_to_trains(spikes: &[SpikeRecord], min_spikes: usize) -> Vec<SpikeTrain> {
    let Some((t_min, t_max)) = session::spike_time_range(spikes) else {
        return Vec::new();
    };

    let t_start = t_min - 1.0;
    let t_stop = t_max + 1.0;

    let unit_ids: Vec<UnitId> = spikes.iter().map(|spike| spike.unit_id).unique().collect();
    let mut trains: HashMap<UnitId, SpikeTrain> = HashMap::default();

    for spike in spikes {
        trains
            .entry(spike.unit_id)
            .or_insert_with(|| SpikeTrain {
                unit_id: spike.unit_id,
                brain_area: spike.brain_area.clone(),
                times: Vec::new(),
                t_start,
                t_stop,
            })
            .times
            .push(spike.spike_time);
    }

    unit_ids
        .into_iter()
        .filter_map(|unit_id| trains.remove(&unit_id))
        .filter(|train| train.len() > min_spikes)
        .collect()
}

pub fn load_spike_trains(
    session: &Session,
    selection_params: &SelectionParams,
) -> RfResult<Vec<SpikeTrain>> {
    try_with!(
        validate_selection_params(selection_params),
        "invalid selection parameters"
    );

    let spikes = match &selection_params.brain_area {
        Some(brain_area) => session::select_brain_area(&session.spikes, brain_area)?,
        None => session.spikes.clone(),
    };

    let spikes = session::select_spikes_around_stimuli(
        &spikes,
        &session.stimuli,
        selection_params.tmin,
        selection_params.tmax,
    );

    let spikes = match selection_params.max_duration {
        Some(max_duration) => session::clip_spikes(&spikes, max_duration),
        None => spikes,
    };

    let trains = spikes_to_trains(&spikes, selection_params.min_spikes);

    log::info!(
        "session {}: {} spike trains from {} spikes",
        session.session_id,
        trains.len(),
        spikes.len()
    );

    Ok(trains)
}

pub fn find_synchronous_spikes(trains: &[SpikeTrain]) -> SynchronousSpikes {
    let mut occurrences: HashMap<u64, Vec<usize>> = HashMap::default();

    for (train_idx, train) in trains.iter().enumerate() {
        for time in &train.times {
            occurrences
                .entry((time + 0.0).to_bits())
                .or_default()
                .push(train_idx);
        }
    }

    let mut synchronous = SynchronousSpikes::default();

    for (bits, train_indices) in occurrences
        .into_iter()
        .filter(|(_, train_indices)| train_indices.len() > 1)
        .sorted_by(|(a, _), (b, _)| f64::from_bits(*a).total_cmp(&f64::from_bits(*b)))
    {
        for train_idx in train_indices {
            synchronous.times.push(f64::from_bits(bits));
            synchronous.train_indices.push(train_idx);
        }
    }

    if synchronous.is_empty() {
        log::info!("no synchronous spikes among {} trains", trains.len());
    }

    synchronous
}
