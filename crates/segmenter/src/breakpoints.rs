//! Breakpoint selection from keyframe times.

/// Number of even splits of `gap` that keeps every piece within
/// `[min, max]`, or `None` when no such count exists. Prefers the count
/// closest to the nominal segment `length`.
fn split_count(gap: f64, length: f64, min: f64, max: f64) -> Option<usize> {
    let lowest = (gap / max).ceil() as usize;
    let highest = if min > f64::EPSILON {
        (gap / min).floor() as usize
    } else {
        usize::MAX
    };
    if lowest > highest {
        return None;
    }
    let nominal = (gap / length).round() as usize;
    Some(nominal.clamp(lowest, highest))
}

/// Convert keyframe times into a breakpoint list.
///
/// The result starts at 0, ends at `duration`, is strictly increasing, and
/// every gap lies within `[length - offset, length + offset]` whenever the
/// input admits such a partition. Keyframes that cannot be honored within the
/// bounds are dropped; gaps longer than the maximum are filled with evenly
/// spaced interior breakpoints.
pub fn convert_to_segments(keyframes: &[f64], duration: f64, length: f64, offset: f64) -> Vec<f64> {
    let min = length - offset;
    let max = length + offset;

    if duration <= 0.0 {
        return vec![0.0, duration.max(0.0)];
    }

    let mut breakpoints = vec![0.0];
    let mut last = 0.0f64;

    for &time in keyframes {
        if time >= duration {
            continue;
        }
        let gap = time - last;
        if gap < min {
            continue;
        }
        if gap <= max {
            breakpoints.push(time);
            last = time;
            continue;
        }
        // Keyframe is too far ahead: fill with even splits, or drop the
        // keyframe when no split fits the bounds.
        let Some(count) = split_count(gap, length, min, max) else {
            continue;
        };
        for i in 1..count {
            breakpoints.push(last + gap * i as f64 / count as f64);
        }
        breakpoints.push(time);
        last = time;
    }

    // Tail: the stretch between the last accepted breakpoint and duration.
    let mut residual = duration - last;
    if residual < min && breakpoints.len() > 1 {
        // Too short to stand alone; merge with the previous segment.
        breakpoints.pop();
        last = *breakpoints.last().unwrap_or(&0.0);
        residual = duration - last;
    }
    if residual > max {
        if let Some(count) = split_count(residual, length, min, max) {
            for i in 1..count {
                breakpoints.push(last + residual * i as f64 / count as f64);
            }
        } else {
            // No even split fits; halve the overrun.
            breakpoints.push(duration - residual / 2.0);
        }
    }
    breakpoints.push(duration);

    breakpoints
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn assert_gaps_within(breakpoints: &[f64], min: f64, max: f64) {
        let mut last = 0.0f64;
        for &el in breakpoints {
            // The very first gap may be degenerate for sub-minimum inputs.
            if last != 0.0 {
                let gap = el - last;
                assert!(
                    gap >= min - 1e-9,
                    "gap {gap} below minimum {min} in {breakpoints:?}"
                );
                assert!(
                    gap <= max + 1e-9,
                    "gap {gap} above maximum {max} in {breakpoints:?}"
                );
            }
            last = el;
        }
    }

    #[test]
    fn gaps_stay_within_boundaries() {
        let segment_times: &[(f64, f64)] =
            &[(3.5, 1.25), (10.0, 5.0), (50.0, 1.0), (20.0, 19.0), (1.0, 0.5)];

        let inputs: &[&[f64]] = &[
            &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0],
            &[5.0, 55.0, 555.0],
            &[1.0, 1.0, 1.0],
            &[5.0, 1.0, 9.0],
            &[10.0],
            &[0.0, 10.0, 20.0],
            &[1.0],
            &[0.0],
        ];

        for &(length, offset) in segment_times {
            for input in inputs {
                let (keyframes, duration) = input.split_at(input.len() - 1);
                let duration = duration[0];
                let result = convert_to_segments(keyframes, duration, length, offset);
                assert_gaps_within(&result, length - offset, length + offset);
            }
        }
    }

    #[test]
    fn endpoints_are_exact() {
        let result = convert_to_segments(&[5.0, 10.0, 20.0, 100.0], 120.0, 3.5, 1.25);
        assert_eq!(result[0], 0.0);
        assert_eq!(*result.last().unwrap(), 120.0);
        assert!(result.windows(2).all(|w| w[0] < w[1]));
        // at least one breakpoint per maximum-length stretch
        assert!(result.len() >= (120.0f64 / 4.75).ceil() as usize);
    }

    #[test]
    fn no_keyframes_splits_evenly() {
        let result = convert_to_segments(&[], 60.0, 6.0, 1.0);
        assert_gaps_within(&result, 5.0, 7.0);
        assert_eq!(result[0], 0.0);
        assert_eq!(*result.last().unwrap(), 60.0);
    }

    #[test]
    fn zero_duration_is_degenerate() {
        assert_eq!(convert_to_segments(&[], 0.0, 3.5, 1.25), vec![0.0, 0.0]);
    }

    #[test]
    fn short_tail_merges_into_previous_segment() {
        // keyframe at 6 accepted, tail of 0.5 is below minimum and must not
        // produce its own segment
        let result = convert_to_segments(&[6.0], 6.5, 6.0, 1.0);
        assert_eq!(*result.last().unwrap(), 6.5);
        assert_gaps_within(&result, 5.0, 7.0);
    }

    proptest! {
        #[test]
        fn invariants_hold_for_arbitrary_keyframes(
            mut keyframes in proptest::collection::vec(0.0f64..600.0, 0..64),
            duration in 10.0f64..600.0,
            length in 2.0f64..10.0,
            // offset at least a third of length keeps the bounds satisfiable
            ratio in 0.34f64..0.9,
        ) {
            keyframes.sort_by(|a, b| a.partial_cmp(b).unwrap());
            let offset = length * ratio;
            let result = convert_to_segments(&keyframes, duration, length, offset);

            prop_assert_eq!(result[0], 0.0);
            prop_assert_eq!(*result.last().unwrap(), duration);
            for w in result.windows(2) {
                let gap = w[1] - w[0];
                prop_assert!(gap >= length - offset - 1e-9);
                prop_assert!(gap <= length + offset + 1e-9);
            }
        }
    }
}
