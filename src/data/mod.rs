/// Dataset collaborator contracts.
///
/// The controller never constructs or augments data itself; it asks a
/// [`DatasetProvider`] for train/eval loaders and only ever blocks on
/// [`BatchDataLoader::next_batch`]. Prefetching and shuffling live behind
/// these traits.
use candle_core::{Device, Result, Tensor};

/// Generic data loader trait
pub trait BatchDataLoader {
    /// Get next batch of (input, target) tensors
    fn next_batch(&mut self, device: &Device) -> Result<Option<(Tensor, Tensor)>>;

    /// Reset loader for new epoch
    fn reset(&mut self);

    /// Get total number of batches
    fn num_batches(&self) -> usize;
}

/// Builds train and evaluation loaders for a configured dataset
pub trait DatasetProvider {
    type Loader: BatchDataLoader;

    /// Build the loader for one split and report the dataset's class count
    fn build_dataset(&self, is_train: bool) -> crate::Result<(Self::Loader, usize)>;
}
