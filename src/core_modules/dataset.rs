// THEORY:
// The `dataset` module holds the small strongly-typed vocabulary shared by every
// other module: which split an image came from, which splits a session samples
// from, and which layer a capture belongs to.
//
// Paths are never assembled from loose strings. A `Split` knows its own image
// and label directories under a dataset root, and a `LayerId` knows the folder
// names it owns under the archival root. Everything that touches the disk goes
// through these helpers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// A named partition of the dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Valid,
    Test,
}

impl Split {
    pub const ALL: [Split; 3] = [Split::Train, Split::Valid, Split::Test];

    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Valid => "valid",
            Split::Test => "test",
        }
    }

    /// `<root>/<split>/images`
    pub fn images_dir(&self, dataset_root: &Path) -> PathBuf {
        dataset_root.join(self.as_str()).join("images")
    }

    /// `<root>/<split>/labels`
    pub fn labels_dir(&self, dataset_root: &Path) -> PathBuf {
        dataset_root.join(self.as_str()).join("labels")
    }

    /// The label file that belongs to an image file name of this split.
    pub fn label_path_for(&self, dataset_root: &Path, image_name: &str) -> PathBuf {
        let stem = Path::new(image_name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.labels_dir(dataset_root).join(format!("{stem}.txt"))
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Split {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "train" => Ok(Split::Train),
            "valid" | "val" => Ok(Split::Valid),
            "test" => Ok(Split::Test),
            other => Err(format!("unknown split '{other}'")),
        }
    }
}

/// Which splits a capture session samples from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SplitMode {
    TrainOnly,
    ValidOnly,
    TestOnly,
    #[default]
    All,
}

impl SplitMode {
    pub fn splits(&self) -> &'static [Split] {
        match self {
            SplitMode::TrainOnly => &[Split::Train],
            SplitMode::ValidOnly => &[Split::Valid],
            SplitMode::TestOnly => &[Split::Test],
            SplitMode::All => &Split::ALL,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SplitMode::TrainOnly => "train_only",
            SplitMode::ValidOnly => "valid_only",
            SplitMode::TestOnly => "test_only",
            SplitMode::All => "all",
        }
    }
}

impl fmt::Display for SplitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SplitMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "train_only" | "train" => Ok(SplitMode::TrainOnly),
            "valid_only" | "valid" => Ok(SplitMode::ValidOnly),
            "test_only" | "test" => Ok(SplitMode::TestOnly),
            "all" => Ok(SplitMode::All),
            other => Err(format!("unknown split mode '{other}'")),
        }
    }
}

/// A layer number. Real layers start at 1; 0 means "no layer started yet".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayerId(pub u32);

impl LayerId {
    pub fn get(&self) -> u32 {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        self.0 >= 1
    }

    /// `layer_<N>`
    pub fn dir_name(&self) -> String {
        format!("layer_{}", self.0)
    }

    /// Folder for the bundle of this layer: `<archive>/layer_<N>`.
    pub fn bundle_dir(&self, archive_root: &Path) -> PathBuf {
        archive_root.join(self.dir_name())
    }

    /// Folder for the raw session copies of this layer: `<archive>/captures/layer_<N>`.
    pub fn captures_dir(&self, archive_root: &Path) -> PathBuf {
        archive_root.join("captures").join(self.dir_name())
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One candidate image of the working pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolItem {
    /// Path relative to the dataset root, always `/`-separated.
    pub id: String,
    pub split: Split,
}

impl PoolItem {
    pub fn new(split: Split, file_name: &str) -> Self {
        Self {
            id: format!("{}/images/{}", split.as_str(), file_name),
            split,
        }
    }

    /// The file name component of the identifier.
    pub fn file_name(&self) -> &str {
        self.id.rsplit('/').next().unwrap_or(&self.id)
    }

    pub fn source_path(&self, dataset_root: &Path) -> PathBuf {
        self.id
            .split('/')
            .fold(dataset_root.to_path_buf(), |acc, part| acc.join(part))
    }

    pub fn label_path(&self, dataset_root: &Path) -> PathBuf {
        self.split.label_path_for(dataset_root, self.file_name())
    }
}
