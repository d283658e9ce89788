use std::ops::Range;

pub fn get_partition_range(
    num_threads: usize,
    thread_id: usize,
    num_units: usize,
) -> Range<usize> {
    let min_partition_size = num_units / num_threads;
    let remainder = num_units % num_threads;

    if thread_id < remainder {
        let partition_size = min_partition_size + 1;
        let start = partition_size * thread_id;
        let end = start + partition_size;
        Range { start, end }
    } else {
        let start =
            (min_partition_size + 1) * remainder + min_partition_size * (thread_id - remainder);
        let end = start + min_partition_size;
        Range { start, end }
    }
}

pub fn linspace(start: f64, stop: f64, num: usize) -> Vec<f64> {
    match num {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (num - 1) as f64;
            (0..num)
                .map(|i| {
                    if i == num - 1 {
                        stop
                    } else {
                        start + step * i as f64
                    }
                })
                .collect()
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    #[test]
    fn partition_range() {
        assert_eq!(get_partition_range(1, 0, 11), Range { start: 0, end: 11 });

        assert_eq!(get_partition_range(2, 0, 11), Range { start: 0, end: 6 });
        assert_eq!(get_partition_range(2, 1, 11), Range { start: 6, end: 11 });

        assert_eq!(get_partition_range(3, 0, 11), Range { start: 0, end: 4 });
        assert_eq!(get_partition_range(3, 1, 11), Range { start: 4, end: 8 });
        assert_eq!(get_partition_range(3, 2, 11), Range { start: 8, end: 11 });

        assert_eq!(get_partition_range(4, 0, 11), Range { start: 0, end: 3 });
        assert_eq!(get_partition_range(4, 1, 11), Range { start: 3, end: 6 });
        assert_eq!(get_partition_range(4, 2, 11), Range { start: 6, end: 9 });
        assert_eq!(get_partition_range(4, 3, 11), Range { start: 9, end: 11 });

        for i in 0..11 {
            assert_eq!(
                get_partition_range(11, i, 11),
                Range {
                    start: i,
                    end: i + 1
                }
            );
        }

        // more threads than units leaves trailing partitions empty
        assert_eq!(get_partition_range(4, 0, 2), Range { start: 0, end: 1 });
        assert_eq!(get_partition_range(4, 1, 2), Range { start: 1, end: 2 });
        assert_eq!(get_partition_range(4, 2, 2), Range { start: 2, end: 2 });
        assert_eq!(get_partition_range(4, 3, 2), Range { start: 2, end: 2 });
    }

    #[test]
    fn linspace_endpoints() {
        let values = linspace(0.0, 1.0, 5);
        assert_eq!(values.len(), 5);
        assert_eq!(values[0], 0.0);
        assert_eq!(values[4], 1.0);
        assert_approx_eq!(f64, values[2], 0.5);

        assert!(linspace(0.0, 1.0, 0).is_empty());
        assert_eq!(linspace(2.0, 3.0, 1), [2.0]);
    }
}
