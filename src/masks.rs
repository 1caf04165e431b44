//! Shared attention mask utilities
//!
//! Causal masks are cached by `(seq_len, sliding_window, device_id, dtype)`
//! so that a run over thousands of equally sized pseudo-sentences builds the
//! mask once. Cache hits are shallow clones (Arc bump, no data copy).

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;
use std::sync::{LazyLock, Mutex, PoisonError};

type MaskKey = (usize, Option<usize>, usize, DType);

/// Type alias for the causal mask cache to reduce type complexity
type CausalMaskCache = LazyLock<Mutex<HashMap<MaskKey, Tensor>>>;

static CAUSAL_MASK_CACHE: CausalMaskCache = LazyLock::new(|| Mutex::new(HashMap::new()));

/// Get device identifier for cache key
///
/// Assumes a single device per type.
fn device_id(device: &Device) -> usize {
    match device {
        Device::Cpu => 0,
        Device::Cuda(_) => 1,
        Device::Metal(_) => 2,
    }
}

/// Whether query position `i` may attend to key position `j`
fn is_visible(i: usize, j: usize, sliding_window: Option<usize>) -> bool {
    j <= i && sliding_window.is_none_or(|window| i - j < window)
}

/// Create or retrieve a cached causal mask for the given sequence length
///
/// # Returns
///
/// A tensor of shape `[1, 1, seq_len, seq_len]` where:
/// - `0.0` for positions that can attend (j <= i, and within the window if any)
/// - `-inf` for positions that cannot attend
///
/// For seq_len=4 without a window:
/// ```text
/// [[[[0, -inf, -inf, -inf],
///    [0,    0, -inf, -inf],
///    [0,    0,    0, -inf],
///    [0,    0,    0,    0]]]]
/// ```
pub fn create_causal_mask(
    seq_len: usize,
    sliding_window: Option<usize>,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    // A window wider than the sequence never masks anything extra
    let sliding_window = sliding_window.filter(|&w| w < seq_len);
    let cache_key = (seq_len, sliding_window, device_id(device), dtype);

    {
        let cache = CAUSAL_MASK_CACHE
            .lock()
            .map_err(|_| anyhow::anyhow!("Causal mask cache poisoned"))?;
        if let Some(cached) = cache.get(&cache_key) {
            return Ok(cached.clone());
        }
    }

    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| {
            (0..seq_len).map(move |j| {
                if is_visible(i, j, sliding_window) {
                    0.0
                } else {
                    f32::NEG_INFINITY
                }
            })
        })
        .collect();
    let mask_tensor = Tensor::from_vec(mask, (1, 1, seq_len, seq_len), device)?.to_dtype(dtype)?;

    CAUSAL_MASK_CACHE
        .lock()
        .map_err(|_| anyhow::anyhow!("Causal mask cache poisoned"))?
        .insert(cache_key, mask_tensor.clone());

    Ok(mask_tensor)
}

/// Clear all cached masks
pub fn clear_mask_caches() {
    CAUSAL_MASK_CACHE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clear();
}

/// Get the current number of cached masks
pub fn mask_cache_size() -> usize {
    CAUSAL_MASK_CACHE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn is_neg_inf(v: f32) -> bool {
        v.is_infinite() && v < 0.0
    }

    #[test]
    #[serial]
    fn test_causal_mask_shape() {
        let mask = create_causal_mask(4, None, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(mask.dims(), &[1, 1, 4, 4]);
    }

    #[test]
    #[serial]
    fn test_causal_mask_values() {
        let mask = create_causal_mask(3, None, &Device::Cpu, DType::F32).unwrap();
        let data: Vec<f32> = mask.flatten_all().unwrap().to_vec1().unwrap();

        // Row 0: [0, -inf, -inf]
        assert_eq!(data[0], 0.0);
        assert!(is_neg_inf(data[1]));
        assert!(is_neg_inf(data[2]));

        // Row 1: [0, 0, -inf]
        assert_eq!(data[3], 0.0);
        assert_eq!(data[4], 0.0);
        assert!(is_neg_inf(data[5]));

        // Row 2: [0, 0, 0]
        assert!(data[6..9].iter().all(|&v| v == 0.0));
    }

    #[test]
    #[serial]
    fn test_sliding_window_mask() {
        let mask = create_causal_mask(4, Some(2), &Device::Cpu, DType::F32).unwrap();
        let rows: Vec<Vec<f32>> = mask.squeeze(0).unwrap().squeeze(0).unwrap().to_vec2().unwrap();

        // Row 3 sees positions 2 and 3 only
        assert!(is_neg_inf(rows[3][0]));
        assert!(is_neg_inf(rows[3][1]));
        assert_eq!(rows[3][2], 0.0);
        assert_eq!(rows[3][3], 0.0);
        // Row 1 still sees 0 and 1
        assert_eq!(rows[1][0], 0.0);
        assert_eq!(rows[1][1], 0.0);
    }

    #[test]
    #[serial]
    fn test_causal_mask_caching() {
        let device = Device::Cpu;
        let dtype = DType::F32;

        clear_mask_caches();
        assert_eq!(mask_cache_size(), 0);

        let _mask1 = create_causal_mask(4, None, &device, dtype).unwrap();
        assert_eq!(mask_cache_size(), 1);

        let _mask2 = create_causal_mask(4, None, &device, dtype).unwrap();
        assert_eq!(mask_cache_size(), 1);

        // Window wider than the sequence shares the plain causal entry
        let _mask3 = create_causal_mask(4, Some(4096), &device, dtype).unwrap();
        assert_eq!(mask_cache_size(), 1);

        let _mask4 = create_causal_mask(8, None, &device, dtype).unwrap();
        assert_eq!(mask_cache_size(), 2);
    }
}
