/// Layer-wise learning-rate decay for fine-tuning pretrained backbones.
///
/// The network depth is partitioned into a fixed number of conceptual
/// buckets; each parameter maps to a bucket from its structural name alone,
/// and each bucket carries a learning-rate multiplier that shrinks toward the
/// input stem. Consulted once at optimizer construction, never in the hot
/// loop.

/// Number of body buckets the ConvNeXt depth is divided into. The stem and
/// the classifier head occupy the two boundary buckets on top of these.
pub const NUM_LAYERS: usize = 12;

/// Maps parameter names to depth buckets and buckets to learning-rate scales.
#[derive(Debug, Clone)]
pub struct LayerDecayAssigner {
    values: Vec<f64>,
}

impl LayerDecayAssigner {
    /// Build from explicit per-bucket multipliers (`NUM_LAYERS + 2` entries,
    /// stem first, head last)
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }

    /// Standard geometric multipliers `decay_rate^(max_layer - layer_id)` for
    /// the ConvNeXt partition
    pub fn for_convnext(decay_rate: f64) -> Self {
        let values = (0..NUM_LAYERS + 2)
            .map(|i| decay_rate.powi((NUM_LAYERS + 1 - i) as i32))
            .collect();
        Self::new(values)
    }

    /// Highest bucket id (the classifier head)
    pub fn max_layer_id(&self) -> usize {
        self.values.len() - 1
    }

    /// Depth bucket for a parameter, a pure function of its structural name.
    ///
    /// Stage-2 blocks are spread over the middle buckets in groups of three;
    /// stage 3 and its downsampling share the deepest body bucket; anything
    /// unrecognized (the classifier head, final norm) lands in the top
    /// bucket.
    pub fn layer_id(&self, var_name: &str) -> usize {
        let part = |idx: usize| -> Option<usize> {
            var_name.split('.').nth(idx)?.parse().ok()
        };

        if var_name.starts_with("downsample_layers") {
            match part(1) {
                Some(0) => 0,
                Some(stage_id @ (1 | 2)) => stage_id + 1,
                Some(_) => NUM_LAYERS,
                None => NUM_LAYERS + 1,
            }
        } else if var_name.starts_with("stages") {
            match (part(1), part(2)) {
                (Some(stage_id @ (0 | 1)), _) => stage_id + 1,
                (Some(2), Some(block_id)) => 3 + block_id / 3,
                (Some(_), _) => NUM_LAYERS,
                (None, _) => NUM_LAYERS + 1,
            }
        } else {
            NUM_LAYERS + 1
        }
    }

    /// Learning-rate multiplier for a bucket
    pub fn scale(&self, layer_id: usize) -> f64 {
        self.values[layer_id.min(self.max_layer_id())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_count() {
        let assigner = LayerDecayAssigner::for_convnext(0.8);
        assert_eq!(assigner.max_layer_id(), NUM_LAYERS + 1);
    }

    #[test]
    fn test_flat_when_decay_is_one() {
        let assigner = LayerDecayAssigner::for_convnext(1.0);
        for layer_id in 0..=assigner.max_layer_id() {
            assert_eq!(assigner.scale(layer_id), 1.0);
        }
    }

    #[test]
    fn test_scale_monotone_increasing_with_depth() {
        let assigner = LayerDecayAssigner::for_convnext(0.8);
        for layer_id in 1..=assigner.max_layer_id() {
            assert!(assigner.scale(layer_id) > assigner.scale(layer_id - 1));
        }
        // head trains at the full rate
        assert!((assigner.scale(assigner.max_layer_id()) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_layer_id_mapping() {
        let assigner = LayerDecayAssigner::for_convnext(0.9);

        assert_eq!(assigner.layer_id("downsample_layers.0.0.weight"), 0);
        assert_eq!(assigner.layer_id("downsample_layers.1.1.bias"), 2);
        assert_eq!(assigner.layer_id("downsample_layers.2.0.weight"), 3);
        assert_eq!(assigner.layer_id("downsample_layers.3.1.weight"), NUM_LAYERS);

        assert_eq!(assigner.layer_id("stages.0.2.gamma"), 1);
        assert_eq!(assigner.layer_id("stages.1.0.dwconv.weight"), 2);
        assert_eq!(assigner.layer_id("stages.2.0.pwconv1.weight"), 3);
        assert_eq!(assigner.layer_id("stages.2.7.pwconv1.weight"), 5);
        assert_eq!(assigner.layer_id("stages.2.26.pwconv1.weight"), 11);
        assert_eq!(assigner.layer_id("stages.3.1.dwconv.weight"), NUM_LAYERS);

        assert_eq!(assigner.layer_id("head.weight"), NUM_LAYERS + 1);
        assert_eq!(assigner.layer_id("norm.bias"), NUM_LAYERS + 1);
    }
}
