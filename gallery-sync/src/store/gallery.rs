use parking_lot::Mutex;
use thiserror::Error;

use gallery_core::{ReorderEntry, UploadedImage};

use super::backend::{CommitBackend, LocalOnly};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GalleryImage {
    pub id: String,
    pub url: String,
    pub display_order: u32,
    pub is_main: bool,
    pub variant_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("image {0} is not in the gallery")]
    ImageNotFound(String),
    #[error("positions {from} and {to} are out of bounds for {len} images")]
    IndexOutOfBounds { from: usize, to: usize, len: usize },
    #[error("another gallery mutation is still in flight")]
    MutationInFlight,
    #[error("remote commit failed: {0}")]
    CommitFailed(String),
    #[error("image deleted, but the new main image could not be saved: {0}")]
    MainCommitFailed(String),
}

#[derive(Debug, Clone)]
struct Snapshot {
    images: Vec<GalleryImage>,
    main_image_id: Option<String>,
}

#[derive(Default)]
struct StoreState {
    images: Vec<GalleryImage>,
    main_image_id: Option<String>,
    variant_filter: Option<String>,
    loading: bool,
    error: Option<StoreError>,
    mutation_in_flight: bool,
    deferred_sync: Option<Vec<GalleryImage>>,
    epoch: u64,
}

/// Owns the committed image collection for one listing. Every mutating
/// operation snapshots the state, applies the change locally, then awaits
/// the backend commit: success keeps the optimistic state, failure
/// restores the snapshot in full and records the error. Mutations are
/// strictly sequential; a second one started mid-commit is refused.
pub struct GalleryStore<B> {
    backend: B,
    state: Mutex<StoreState>,
}

impl GalleryStore<LocalOnly> {
    pub fn local_only() -> Self {
        Self::new(LocalOnly)
    }
}

impl<B: CommitBackend> GalleryStore<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            state: Mutex::new(StoreState::default()),
        }
    }

    /// Moves the image at `from` to `to` and renumbers the dense display
    /// order before committing the full ordered list. `from == to` is a
    /// no-op that returns true without a remote call.
    pub async fn reorder_images(&self, from: usize, to: usize) -> bool {
        {
            let mut state = self.state.lock();
            let len = state.images.len();
            if from >= len || to >= len {
                state.error = Some(StoreError::IndexOutOfBounds { from, to, len });
                return false;
            }
        }
        if from == to {
            return true;
        }
        let Some((snapshot, epoch)) = self.begin_mutation() else {
            return false;
        };
        let ordered: Vec<ReorderEntry> = {
            let mut state = self.state.lock();
            let image = state.images.remove(from);
            state.images.insert(to, image);
            renumber(&mut state.images);
            state
                .images
                .iter()
                .map(|image| ReorderEntry {
                    image_id: image.id.clone(),
                    display_order: image.display_order,
                })
                .collect()
        };
        match self.backend.commit_order(&ordered).await {
            Ok(()) => {
                self.settle_mutation(epoch, None, None);
                true
            }
            Err(err) => {
                self.settle_mutation(
                    epoch,
                    Some(snapshot),
                    Some(StoreError::CommitFailed(err.to_string())),
                );
                false
            }
        }
    }

    /// Removes the image. When the main image is deleted and others
    /// remain, the first remaining image in array order is promoted
    /// optimistically; its commit is best-effort and does not undo the
    /// deletion when it fails, since the two are independent remote
    /// resources.
    pub async fn delete_image(&self, id: &str) -> bool {
        let Some((snapshot, epoch)) = self.begin_mutation() else {
            return false;
        };
        let removal = {
            let mut state = self.state.lock();
            match state.images.iter().position(|image| image.id == id) {
                None => None,
                Some(position) => {
                    let removed = state.images.remove(position);
                    renumber(&mut state.images);
                    let mut promoted = None;
                    if removed.is_main {
                        if let Some(first) = state.images.first_mut() {
                            first.is_main = true;
                            promoted = Some(first.id.clone());
                        }
                        state.main_image_id = promoted.clone();
                    }
                    Some((removed, promoted))
                }
            }
        };
        let Some((removed, promoted)) = removal else {
            self.settle_mutation(epoch, None, Some(StoreError::ImageNotFound(id.to_string())));
            return false;
        };
        match self.backend.commit_delete(&removed).await {
            Err(err) => {
                self.settle_mutation(
                    epoch,
                    Some(snapshot),
                    Some(StoreError::CommitFailed(err.to_string())),
                );
                false
            }
            Ok(()) => {
                if let Some(new_main) = promoted {
                    if let Err(err) = self.backend.commit_main(&new_main).await {
                        self.settle_mutation(
                            epoch,
                            None,
                            Some(StoreError::MainCommitFailed(err.to_string())),
                        );
                        return false;
                    }
                }
                self.settle_mutation(epoch, None, None);
                true
            }
        }
    }

    /// Exactly the target carries `is_main` afterwards.
    pub async fn set_main_image(&self, id: &str) -> bool {
        let Some((snapshot, epoch)) = self.begin_mutation() else {
            return false;
        };
        let found = {
            let mut state = self.state.lock();
            if state.images.iter().any(|image| image.id == id) {
                for image in &mut state.images {
                    image.is_main = image.id == id;
                }
                state.main_image_id = Some(id.to_string());
                true
            } else {
                false
            }
        };
        if !found {
            self.settle_mutation(epoch, None, Some(StoreError::ImageNotFound(id.to_string())));
            return false;
        }
        match self.backend.commit_main(id).await {
            Ok(()) => {
                self.settle_mutation(epoch, None, None);
                true
            }
            Err(err) => {
                self.settle_mutation(
                    epoch,
                    Some(snapshot),
                    Some(StoreError::CommitFailed(err.to_string())),
                );
                false
            }
        }
    }

    /// Local bookkeeping only; variant image uploads are a separate flow.
    /// Several images may carry the same key; uniqueness is a product
    /// rule enforced elsewhere.
    pub fn associate_variant(&self, id: &str, variant_key: Option<String>) -> bool {
        let mut state = self.state.lock();
        if state.mutation_in_flight {
            state.error = Some(StoreError::MutationInFlight);
            return false;
        }
        match state.images.iter_mut().find(|image| image.id == id) {
            Some(image) => {
                image.variant_key = variant_key;
                true
            }
            None => {
                state.error = Some(StoreError::ImageNotFound(id.to_string()));
                false
            }
        }
    }

    /// Images tagged with `key`; when none are, the untagged images serve
    /// as the shared default display.
    pub fn filter_by_variant(&self, key: &str) -> Vec<GalleryImage> {
        let state = self.state.lock();
        variant_view(&state.images, key)
    }

    /// The variant-filtered view when a filter is selected, otherwise the
    /// whole collection.
    pub fn images(&self) -> Vec<GalleryImage> {
        let state = self.state.lock();
        match &state.variant_filter {
            Some(key) => variant_view(&state.images, key),
            None => state.images.clone(),
        }
    }

    pub fn set_variant_filter(&self, key: Option<String>) {
        self.state.lock().variant_filter = key;
    }

    /// Merges completed uploads into the collection; the remote resources
    /// already exist, so there is no commit. The first image added to an
    /// empty gallery becomes main.
    pub fn add_images(&self, uploaded: Vec<UploadedImage>, variant_key: Option<String>) -> bool {
        let mut state = self.state.lock();
        if state.mutation_in_flight {
            state.error = Some(StoreError::MutationInFlight);
            return false;
        }
        let mut next_order = state.images.len() as u32;
        let make_first_main = state.images.is_empty() && state.main_image_id.is_none();
        for (index, image) in uploaded.into_iter().enumerate() {
            let is_main = make_first_main && index == 0;
            if is_main {
                state.main_image_id = Some(image.public_id.clone());
            }
            state.images.push(GalleryImage {
                id: image.public_id,
                url: image.url,
                display_order: next_order,
                is_main,
                variant_key: variant_key.clone(),
            });
            next_order += 1;
        }
        true
    }

    /// Replaces local state from the externally supplied collection and
    /// rescans for the main flag. Deferred while a mutation is pending and
    /// applied once it settles.
    pub fn sync_from_remote(&self, images: Vec<GalleryImage>) {
        let mut state = self.state.lock();
        if state.mutation_in_flight {
            state.deferred_sync = Some(images);
            return;
        }
        apply_sync(&mut state, images);
    }

    pub fn all_images(&self) -> Vec<GalleryImage> {
        self.state.lock().images.clone()
    }

    pub fn image_count(&self) -> usize {
        self.state.lock().images.len()
    }

    pub fn main_image_id(&self) -> Option<String> {
        self.state.lock().main_image_id.clone()
    }

    pub fn main_image_url(&self) -> Option<String> {
        let state = self.state.lock();
        state
            .main_image_id
            .as_ref()
            .and_then(|id| state.images.iter().find(|image| &image.id == id))
            .map(|image| image.url.clone())
    }

    pub fn is_loading(&self) -> bool {
        self.state.lock().loading
    }

    pub fn error(&self) -> Option<StoreError> {
        self.state.lock().error.clone()
    }

    pub fn clear_error(&self) {
        self.state.lock().error = None;
    }

    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.images.clear();
        state.main_image_id = None;
        state.variant_filter = None;
        state.loading = false;
        state.error = None;
        state.mutation_in_flight = false;
        state.deferred_sync = None;
        // An in-flight commit from before the reset must not resurrect
        // old state when it settles.
        state.epoch += 1;
    }

    fn begin_mutation(&self) -> Option<(Snapshot, u64)> {
        let mut state = self.state.lock();
        if state.mutation_in_flight {
            state.error = Some(StoreError::MutationInFlight);
            return None;
        }
        state.mutation_in_flight = true;
        state.loading = true;
        Some((
            Snapshot {
                images: state.images.clone(),
                main_image_id: state.main_image_id.clone(),
            },
            state.epoch,
        ))
    }

    fn settle_mutation(&self, epoch: u64, rollback: Option<Snapshot>, error: Option<StoreError>) {
        let mut state = self.state.lock();
        if state.epoch != epoch {
            return;
        }
        if let Some(snapshot) = rollback {
            state.images = snapshot.images;
            state.main_image_id = snapshot.main_image_id;
        }
        if let Some(error) = error {
            state.error = Some(error);
        }
        state.mutation_in_flight = false;
        state.loading = false;
        if let Some(images) = state.deferred_sync.take() {
            apply_sync(&mut state, images);
        }
    }
}

fn renumber(images: &mut [GalleryImage]) {
    for (index, image) in images.iter_mut().enumerate() {
        image.display_order = index as u32;
    }
}

fn variant_view(images: &[GalleryImage], key: &str) -> Vec<GalleryImage> {
    let matched: Vec<GalleryImage> = images
        .iter()
        .filter(|image| image.variant_key.as_deref() == Some(key))
        .cloned()
        .collect();
    if !matched.is_empty() {
        return matched;
    }
    images
        .iter()
        .filter(|image| image.variant_key.is_none())
        .cloned()
        .collect()
}

fn apply_sync(state: &mut StoreState, mut images: Vec<GalleryImage>) {
    images.sort_by_key(|image| image.display_order);
    renumber(&mut images);
    state.main_image_id = images
        .iter()
        .find(|image| image.is_main)
        .map(|image| image.id.clone());
    state.images = images;
}
