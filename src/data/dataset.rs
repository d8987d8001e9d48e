use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TptError;

/// Benchmarks the CLI knows about. Each is read as an image folder; the kind
/// only fixes the directory name and the expected class count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    #[default]
    ImagenetV2,
    ImagenetA,
}

impl DatasetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetKind::ImagenetV2 => "imagenet_v2",
            DatasetKind::ImagenetA => "imagenet_a",
        }
    }

    pub fn expected_classes(&self) -> usize {
        match self {
            DatasetKind::ImagenetV2 => 1000,
            DatasetKind::ImagenetA => 200,
        }
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatasetKind {
    type Err = TptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "imagenet_v2" | "imagenetv2" => Ok(DatasetKind::ImagenetV2),
            "imagenet_a" | "imageneta" => Ok(DatasetKind::ImagenetA),
            other => Err(TptError::Config(format!("unknown dataset '{}'", other))),
        }
    }
}
