// THEORY:
// The `PoolBuilder` stands in for the camera. Before a session fills its slots,
// it scans the dataset and produces the ordered list of images the session will
// "capture", consumed front to back without replacement.
//
// Key rules:
// 1.  **Candidates**: an image qualifies by extension alone (jpg, jpeg, png).
// 2.  **Label preference**: with `require_label`, only images that have a
//     same-stem label file are kept. The preference is judged over every split
//     the mode covers: only when none of them has a single labeled image are
//     the unfiltered images used, with a warning. Missing labels degrade the
//     demo, they never stop it.
// 3.  **One shuffle**: for `SplitMode::All` the three splits are concatenated
//     first and shuffled once as a whole, so no split is favoured by position.
// 4.  **Empty is fatal**: a pool with nothing in it is the single error this
//     module can produce.

use crate::core_modules::dataset::{PoolItem, SplitMode};
use crate::error::{CaptureError, Result};
use rand::Rng;
use rand::seq::SliceRandom;
use std::collections::VecDeque;
use std::path::Path;

pub const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

pub fn has_image_extension(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.iter().any(|x| e.eq_ignore_ascii_case(x)))
        .unwrap_or(false)
}

/// Builds shuffled capture pools from a dataset root.
pub struct PoolBuilder<'a> {
    dataset_root: &'a Path,
    mode: SplitMode,
    require_label: bool,
}

impl<'a> PoolBuilder<'a> {
    pub fn new(dataset_root: &'a Path, mode: SplitMode, require_label: bool) -> Self {
        Self {
            dataset_root,
            mode,
            require_label,
        }
    }

    /// Builds a pool shuffled with the thread-local RNG.
    pub fn build(&self) -> Result<VecDeque<PoolItem>> {
        self.build_with_rng(&mut rand::rng())
    }

    pub fn build_with_rng<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<VecDeque<PoolItem>> {
        let mut items = self.candidates();

        if items.is_empty() {
            return Err(CaptureError::Configuration(format!(
                "no images with extensions {:?} found for split mode '{}' under {}",
                IMAGE_EXTENSIONS,
                self.mode,
                self.dataset_root.display()
            )));
        }

        items.shuffle(rng);
        tracing::info!(mode = %self.mode, size = items.len(), "built capture pool");
        Ok(items.into())
    }

    /// Qualifying images of every split in the mode, in split then file name
    /// order, before shuffling.
    pub fn candidates(&self) -> Vec<PoolItem> {
        let mut all = Vec::new();
        let mut labeled = Vec::new();

        for split in self.mode.splits() {
            let mut names = list_image_names(&split.images_dir(self.dataset_root));
            names.sort();
            for name in names {
                let item = PoolItem::new(*split, &name);
                if self.require_label && split.label_path_for(self.dataset_root, &name).is_file() {
                    labeled.push(item.clone());
                }
                all.push(item);
            }
        }

        if !self.require_label || all.is_empty() {
            return all;
        }
        if labeled.is_empty() {
            tracing::warn!(
                mode = %self.mode,
                images = all.len(),
                "no labeled images in any split, using unlabeled images instead"
            );
            return all;
        }
        labeled
    }
}

/// File names with an image extension in `dir`. Unreadable or missing
/// directories yield nothing.
fn list_image_names(dir: &Path) -> Vec<String> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!(dir = ?dir, error = %e, "split image directory not readable");
            return Vec::new();
        }
    };

    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|entry| entry.file_name().to_str().map(str::to_owned))
        .filter(|name| has_image_extension(name))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::dataset::Split;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::fs;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    /// train: a.jpg(labeled) b.PNG c.txt ; valid: d.jpeg (unlabeled) ; test: none
    fn dataset() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(&root.join("train/images/a.jpg"));
        touch(&root.join("train/images/b.PNG"));
        touch(&root.join("train/images/c.txt"));
        touch(&root.join("train/labels/a.txt"));
        touch(&root.join("valid/images/d.jpeg"));
        dir
    }

    #[test]
    fn only_image_extensions_qualify() {
        assert!(has_image_extension("x.JPG"));
        assert!(has_image_extension("x.jpeg"));
        assert!(has_image_extension("x.png"));
        assert!(!has_image_extension("x.gif"));
        assert!(!has_image_extension("jpg"));
    }

    #[test]
    fn labeled_images_are_preferred() {
        let dir = dataset();
        let builder = PoolBuilder::new(dir.path(), SplitMode::TrainOnly, true);
        let pool = builder.build_with_rng(&mut StdRng::seed_from_u64(1)).unwrap();

        let ids: Vec<_> = pool.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, ["train/images/a.jpg"]);
    }

    #[test]
    fn unlabeled_split_falls_back_to_all_images() {
        let dir = dataset();
        let builder = PoolBuilder::new(dir.path(), SplitMode::ValidOnly, true);
        let pool = builder.build_with_rng(&mut StdRng::seed_from_u64(1)).unwrap();

        assert_eq!(pool.len(), 1);
        assert_eq!(pool[0].id, "valid/images/d.jpeg");
        assert_eq!(pool[0].split, Split::Valid);
    }

    #[test]
    fn without_label_requirement_every_image_counts() {
        let dir = dataset();
        let builder = PoolBuilder::new(dir.path(), SplitMode::TrainOnly, false);
        let pool = builder.build_with_rng(&mut StdRng::seed_from_u64(7)).unwrap();

        let mut ids: Vec<_> = pool.iter().map(|p| p.id.clone()).collect();
        ids.sort();
        assert_eq!(ids, ["train/images/a.jpg", "train/images/b.PNG"]);
    }

    #[test]
    fn all_mode_keeps_only_labeled_images_when_any_split_has_labels() {
        let dir = dataset();
        let builder = PoolBuilder::new(dir.path(), SplitMode::All, true);

        for seed in 0..8 {
            let pool = builder.build_with_rng(&mut StdRng::seed_from_u64(seed)).unwrap();
            let ids: Vec<_> = pool.iter().map(|p| p.id.as_str()).collect();
            assert_eq!(ids, ["train/images/a.jpg"]);
            for item in &pool {
                assert!(item.label_path(dir.path()).is_file(), "{} has no label", item.id);
            }
        }
    }

    #[test]
    fn all_mode_without_any_labels_uses_every_image() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("train/images/a.jpg"));
        touch(&dir.path().join("valid/images/d.jpeg"));
        touch(&dir.path().join("test/images/e.png"));

        let builder = PoolBuilder::new(dir.path(), SplitMode::All, true);
        let pool = builder.build_with_rng(&mut StdRng::seed_from_u64(3)).unwrap();

        let mut ids: Vec<_> = pool.iter().map(|p| p.id.clone()).collect();
        ids.sort();
        assert_eq!(ids, ["test/images/e.png", "train/images/a.jpg", "valid/images/d.jpeg"]);
        for item in &pool {
            assert!(has_image_extension(item.file_name()));
        }
    }

    #[test]
    fn same_seed_same_order() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..12 {
            touch(&dir.path().join(format!("test/images/{i:02}.png")));
        }
        let builder = PoolBuilder::new(dir.path(), SplitMode::TestOnly, false);
        let a = builder.build_with_rng(&mut StdRng::seed_from_u64(42)).unwrap();
        let b = builder.build_with_rng(&mut StdRng::seed_from_u64(42)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn empty_dataset_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = PoolBuilder::new(dir.path(), SplitMode::All, true).build().unwrap_err();
        assert!(matches!(err, CaptureError::Configuration(_)));
    }
}
