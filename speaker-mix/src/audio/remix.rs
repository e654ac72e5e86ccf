//! Channel count conversion (downmix / upmix)

/// Convert interleaved `samples` from `in_channels` to `out_channels`
///
/// - Equal counts: copy
/// - To mono: average all input channels
/// - From mono: duplicate to every output channel
/// - Otherwise: output channel `c` takes input channel `c % in_channels`
pub fn remix(samples: &[f32], in_channels: u16, out_channels: u16) -> Vec<f32> {
    let in_ch = in_channels.max(1) as usize;
    let out_ch = out_channels.max(1) as usize;

    if in_ch == out_ch {
        return samples.to_vec();
    }

    let frames = samples.len() / in_ch;
    let mut output = Vec::with_capacity(frames * out_ch);

    for frame in samples.chunks_exact(in_ch) {
        if out_ch == 1 {
            output.push(frame.iter().sum::<f32>() / in_ch as f32);
        } else {
            for c in 0..out_ch {
                output.push(frame[c % in_ch]);
            }
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_layout_is_copy() {
        let input = vec![0.1, 0.2, 0.3, 0.4];
        assert_eq!(remix(&input, 2, 2), input);
    }

    #[test]
    fn test_stereo_to_mono_averages() {
        let output = remix(&[0.2, 0.4, -1.0, 1.0], 2, 1);
        assert_eq!(output.len(), 2);
        assert!((output[0] - 0.3).abs() < 1e-6);
        assert_eq!(output[1], 0.0);
    }

    #[test]
    fn test_mono_to_stereo_duplicates() {
        assert_eq!(remix(&[0.5, -0.5], 1, 2), vec![0.5, 0.5, -0.5, -0.5]);
    }

    #[test]
    fn test_partial_frame_is_dropped() {
        assert_eq!(remix(&[0.5, 0.5, 0.9], 2, 1), vec![0.5]);
    }

    #[test]
    fn test_surround_to_stereo_takes_front_pair() {
        let frame = [0.1, 0.2, 0.3, 0.4, 0.5, 0.6];
        assert_eq!(remix(&frame, 6, 2), vec![0.1, 0.2]);
    }
}
