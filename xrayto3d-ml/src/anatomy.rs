//! Anatomy labels, their expected volume geometry and loss weighting.

use crate::error::MlError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path};
use std::str::FromStr;

/// Target skeletal structure, optionally qualified by the dataset it comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Anatomy {
    Hip,
    Femur,
    Vertebra,
    Rib,
    TotalsegFemur,
    TotalsegRibs,
    TotalsegHips,
    Verse2019,
    Verse2020,
}

/// Path fragments checked in order; more specific labels come first so that
/// `totalseg_ribs` is not read as `rib`.
const PATH_MARKERS: &[(&str, Anatomy)] = &[
    ("totalseg_femur", Anatomy::TotalsegFemur),
    ("totalseg_ribs", Anatomy::TotalsegRibs),
    ("totalseg_hips", Anatomy::TotalsegHips),
    ("verse2019", Anatomy::Verse2019),
    ("verse2020", Anatomy::Verse2020),
    ("femur", Anatomy::Femur),
    ("rib", Anatomy::Rib),
    ("hip", Anatomy::Hip),
    ("vertebra", Anatomy::Vertebra),
    ("verse", Anatomy::Vertebra),
];

/// The file name and this many path segments in total name the dataset.
const DATASET_SEGMENTS: usize = 3;

fn marker_in(text: &str) -> Option<Anatomy> {
    PATH_MARKERS
        .iter()
        .find(|(marker, _)| text.contains(marker))
        .map(|(_, anatomy)| *anatomy)
}

impl Anatomy {
    pub const ALL: [Anatomy; 9] = [
        Anatomy::Hip,
        Anatomy::Femur,
        Anatomy::Vertebra,
        Anatomy::Rib,
        Anatomy::TotalsegFemur,
        Anatomy::TotalsegRibs,
        Anatomy::TotalsegHips,
        Anatomy::Verse2019,
        Anatomy::Verse2020,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Anatomy::Hip => "hip",
            Anatomy::Femur => "femur",
            Anatomy::Vertebra => "vertebra",
            Anatomy::Rib => "rib",
            Anatomy::TotalsegFemur => "totalseg_femur",
            Anatomy::TotalsegRibs => "totalseg_ribs",
            Anatomy::TotalsegHips => "totalseg_hips",
            Anatomy::Verse2019 => "verse2019",
            Anatomy::Verse2020 => "verse2020",
        }
    }

    /// The structure without its dataset qualifier.
    pub fn base(&self) -> Anatomy {
        match self {
            Anatomy::Hip | Anatomy::TotalsegHips => Anatomy::Hip,
            Anatomy::Femur | Anatomy::TotalsegFemur => Anatomy::Femur,
            Anatomy::Vertebra | Anatomy::Verse2019 | Anatomy::Verse2020 => Anatomy::Vertebra,
            Anatomy::Rib | Anatomy::TotalsegRibs => Anatomy::Rib,
        }
    }

    /// Scalar positive-class weight compensating foreground/background imbalance.
    pub fn pos_weight(&self) -> f32 {
        match self {
            Anatomy::Hip | Anatomy::TotalsegHips => 719.0,
            Anatomy::Femur | Anatomy::TotalsegFemur => 612.0,
            Anatomy::Vertebra | Anatomy::Verse2019 | Anatomy::Verse2020 => 23.0,
            Anatomy::Rib | Anatomy::TotalsegRibs => 5231.0,
        }
    }

    /// Reference volume geometry as (voxels per side, mm per voxel).
    pub fn reference_geometry(&self) -> (usize, f64) {
        match self {
            Anatomy::Femur | Anatomy::TotalsegFemur => (128, 1.0),
            Anatomy::Rib | Anatomy::TotalsegRibs => (320, 1.0),
            Anatomy::Hip | Anatomy::TotalsegHips => (288, 1.0),
            Anatomy::Vertebra | Anatomy::Verse2019 | Anatomy::Verse2020 => (96, 1.0),
        }
    }

    /// Check that `size * res` covers the same physical extent as the reference.
    pub fn check_geometry(&self, size: usize, res: f64) -> Result<(), MlError> {
        let (orig_size, orig_res) = self.reference_geometry();
        let extent = (size as f64 * res) as i64;
        let reference = (orig_size as f64 * orig_res) as i64;
        if extent != reference {
            return Err(MlError::invalid_input(format!(
                "({size},{res}) does not match ({orig_size},{orig_res}) for anatomy {self}"
            )));
        }
        Ok(())
    }

    /// Infer the anatomy from a dataset manifest path.
    ///
    /// The file name and its nearest directories are searched together, so a
    /// qualified label anywhere in them wins. Failing that, outer directories are
    /// tried one at a time from the nearest outwards.
    pub fn from_path(path: &Path) -> Result<Anatomy, MlError> {
        let segments: Vec<String> = path
            .components()
            .rev()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy().to_lowercase()),
                _ => None,
            })
            .collect();
        let (dataset, outer) = segments.split_at(segments.len().min(DATASET_SEGMENTS));
        marker_in(&dataset.join("/"))
            .or_else(|| outer.iter().find_map(|s| marker_in(s)))
            .ok_or_else(|| {
                MlError::lookup(format!(
                    "cannot infer anatomy from path {}",
                    path.display()
                ))
            })
    }
}

impl fmt::Display for Anatomy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Anatomy {
    type Err = MlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "verse" {
            return Ok(Anatomy::Vertebra);
        }
        Anatomy::ALL
            .iter()
            .find(|a| a.as_str() == s)
            .copied()
            .ok_or_else(|| MlError::lookup(format!("unknown anatomy '{s}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_pos_weight_table() {
        assert_eq!(Anatomy::Hip.pos_weight(), 719.0);
        assert_eq!(Anatomy::Femur.pos_weight(), 612.0);
        assert_eq!(Anatomy::Vertebra.pos_weight(), 23.0);
        assert_eq!(Anatomy::Rib.pos_weight(), 5231.0);
        assert_eq!(Anatomy::TotalsegFemur.pos_weight(), 612.0);
        assert_eq!(Anatomy::Verse2020.pos_weight(), 23.0);
    }

    #[test]
    fn test_parse_roundtrip() {
        for anatomy in Anatomy::ALL {
            assert_eq!(anatomy.as_str().parse::<Anatomy>().unwrap(), anatomy);
        }
        assert_eq!("verse".parse::<Anatomy>().unwrap(), Anatomy::Vertebra);
    }

    #[test]
    fn test_unknown_anatomy_is_lookup_error() {
        let err = "skull".parse::<Anatomy>().unwrap_err();
        assert!(matches!(err, MlError::Lookup(_)));
        assert!(err.to_string().contains("skull"));
    }

    #[test]
    fn test_from_path_prefers_qualified_labels() {
        let path = PathBuf::from("configs/paths/totalseg_ribs/train.csv");
        assert_eq!(Anatomy::from_path(&path).unwrap(), Anatomy::TotalsegRibs);

        let path = PathBuf::from("configs/paths/verse19/Verse2019-DRR-full_train.csv");
        assert_eq!(Anatomy::from_path(&path).unwrap(), Anatomy::Verse2019);

        let path = PathBuf::from("configs/paths/femur/30k/TotalSeg-femur-left_train.csv");
        assert_eq!(Anatomy::from_path(&path).unwrap(), Anatomy::Femur);
    }

    #[test]
    fn test_from_path_ignores_home_directory_names() {
        let path = PathBuf::from("/home/shipra/xrayto3d/configs/paths/vertebra/train.csv");
        assert_eq!(Anatomy::from_path(&path).unwrap(), Anatomy::Vertebra);

        let path = PathBuf::from("/home/shipra/data/femur/splits/v1/train.csv");
        assert_eq!(Anatomy::from_path(&path).unwrap(), Anatomy::Femur);

        let path = PathBuf::from("/home/shipra/xrayto3d/configs/paths/totalseg_hips/train.csv");
        assert_eq!(Anatomy::from_path(&path).unwrap(), Anatomy::TotalsegHips);
    }

    #[test]
    fn test_from_path_unknown() {
        let path = PathBuf::from("configs/paths/skull/train.csv");
        assert!(matches!(
            Anatomy::from_path(&path),
            Err(MlError::Lookup(_))
        ));
    }

    #[test]
    fn test_check_geometry() {
        assert!(Anatomy::Femur.check_geometry(128, 1.0).is_ok());
        assert!(Anatomy::Femur.check_geometry(64, 2.0).is_ok());
        assert!(Anatomy::Vertebra.check_geometry(64, 1.5).is_ok());
        assert!(Anatomy::Hip.check_geometry(128, 2.25).is_ok());
        assert!(Anatomy::Femur.check_geometry(64, 1.0).is_err());
    }
}
