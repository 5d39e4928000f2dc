// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fs;
use std::path::{Path, PathBuf};

use canonical_error::{failed_precondition_error, invalid_argument_error,
                      CanonicalError};
use serde_json::{Map, Value};

use crate::imaging::SubFrame;

/// Everything recorded for one model point. Angles in degrees (right
/// ascension included), errors in arcseconds.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SolvedFrame {
    pub index: usize,
    pub azimuth: f64,
    pub altitude: f64,
    // Mount pointing at exposure start.
    pub ra_jnow: f64,
    pub dec_jnow: f64,
    pub ra_j2000: f64,
    pub dec_j2000: f64,
    pub ra_j2000_solved: f64,
    pub dec_j2000_solved: f64,
    pub ra_jnow_solved: f64,
    pub dec_jnow_solved: f64,
    pub local_sidereal_time: String,
    // Hours.
    pub local_sidereal_hours: f64,
    pub pier_side: char,
    // Arcsec/pixel.
    pub scale: f64,
    pub roll: f64,
    // Seconds.
    pub solve_time: f64,
    pub binning: u32,
    pub exposure: f64,
    pub sub_frame: Option<SubFrame>,
    pub image_path: PathBuf,
    pub refraction_temperature: f64,
    pub refraction_pressure: f64,
    pub ra_error: f64,
    pub dec_error: f64,
    pub model_error: f64,
    // 1-based alignment star number once programmed into the mount.
    pub star_index: Option<usize>,
}

/// Columns every artifact carries, in this order.
pub const REQUIRED_COLUMNS: [&str; 17] = [
    "Index", "Azimuth", "Altitude", "RaJ2000", "DecJ2000", "RaJNow", "DecJNow",
    "RaJ2000Solved", "DecJ2000Solved", "RaJNowSolved", "DecJNowSolved",
    "RaError", "DecError", "ModelError", "Pierside", "LocalSiderealTime",
    "LocalSiderealTimeFloat",
];

const LEGACY_MARKER: &str = "!TheSkyX";

/// Per-point results of one run as parallel columns.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunArtifact {
    columns: Map<String, Value>,
}

impl RunArtifact {
    /// An artifact with all required columns and no rows.
    pub fn empty() -> Self {
        RunArtifact::from_frames(&[])
    }

    pub fn from_frames(frames: &[SolvedFrame]) -> Self {
        let mut columns = Map::new();
        let mut column = |name: &str, values: Vec<Value>| {
            columns.insert(name.to_string(), Value::Array(values));
        };
        let f = |get: fn(&SolvedFrame) -> f64| -> Vec<Value> {
            frames.iter().map(|fr| Value::from(get(fr))).collect()
        };
        column("Index", frames.iter().map(|fr| Value::from(fr.index)).collect());
        column("Azimuth", f(|fr| fr.azimuth));
        column("Altitude", f(|fr| fr.altitude));
        column("RaJ2000", f(|fr| fr.ra_j2000));
        column("DecJ2000", f(|fr| fr.dec_j2000));
        column("RaJNow", f(|fr| fr.ra_jnow));
        column("DecJNow", f(|fr| fr.dec_jnow));
        column("RaJ2000Solved", f(|fr| fr.ra_j2000_solved));
        column("DecJ2000Solved", f(|fr| fr.dec_j2000_solved));
        column("RaJNowSolved", f(|fr| fr.ra_jnow_solved));
        column("DecJNowSolved", f(|fr| fr.dec_jnow_solved));
        column("RaError", f(|fr| fr.ra_error));
        column("DecError", f(|fr| fr.dec_error));
        column("ModelError", f(|fr| fr.model_error));
        column("Pierside", frames.iter()
               .map(|fr| Value::from(fr.pier_side.to_string())).collect());
        column("LocalSiderealTime", frames.iter()
               .map(|fr| Value::from(fr.local_sidereal_time.clone())).collect());
        column("LocalSiderealTimeFloat", f(|fr| fr.local_sidereal_hours));
        column("Scale", f(|fr| fr.scale));
        column("Angle", f(|fr| fr.roll));
        column("TimeToSolve", f(|fr| fr.solve_time));
        column("Binning", frames.iter().map(|fr| Value::from(fr.binning)).collect());
        column("Exposure", f(|fr| fr.exposure));
        let sub = |get: fn(&SubFrame) -> usize| -> Vec<Value> {
            frames.iter()
                .map(|fr| fr.sub_frame.as_ref().map(get).map(Value::from).unwrap_or(Value::Null))
                .collect()
        };
        column("OffX", sub(|s| s.off_x));
        column("OffY", sub(|s| s.off_y));
        column("SizeX", sub(|s| s.size_x));
        column("SizeY", sub(|s| s.size_y));
        column("ImagePath", frames.iter()
               .map(|fr| Value::from(fr.image_path.to_string_lossy().to_string())).collect());
        column("RefractionTemperature", f(|fr| fr.refraction_temperature));
        column("RefractionPressure", f(|fr| fr.refraction_pressure));
        column("StarIndex", frames.iter()
               .map(|fr| fr.star_index.map(Value::from).unwrap_or(Value::Null)).collect());
        RunArtifact { columns }
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.columns.values()
            .filter_map(|v| v.as_array())
            .map(|a| a.len())
            .next()
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn column_names(&self) -> impl Iterator<Item = &String> {
        self.columns.keys()
    }

    pub fn column(&self, name: &str) -> Option<&Vec<Value>> {
        self.columns.get(name)?.as_array()
    }

    pub fn column_f64(&self, name: &str) -> Option<Vec<f64>> {
        self.column(name)?.iter().map(|v| v.as_f64()).collect()
    }

    /// Checks that every column is an array and all have the same length.
    pub fn validate(&self) -> Result<(), CanonicalError> {
        let mut length = None;
        for (name, value) in &self.columns {
            let Some(array) = value.as_array() else {
                return Err(invalid_argument_error(
                    format!("Column {} is not an array", name).as_str()));
            };
            match length {
                None => length = Some(array.len()),
                Some(n) if n != array.len() => {
                    return Err(invalid_argument_error(format!(
                        "Column {} has {} rows, expected {}", name, array.len(), n).as_str()));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Single-line JSON object of columns.
    pub fn to_json(&self) -> String {
        Value::Object(self.columns.clone()).to_string()
    }

    /// Writes to a temporary sibling, then renames over `path`.
    pub fn write_atomic(&self, path: &Path) -> Result<(), CanonicalError> {
        let mut temp = path.as_os_str().to_owned();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);
        let io_error = |e: std::io::Error| {
            failed_precondition_error(format!("Cannot write {:?}: {}", path, e).as_str())
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_error)?;
            }
        }
        fs::write(&temp, self.to_json()).map_err(io_error)?;
        fs::rename(&temp, path).map_err(io_error)
    }

    /// Parses either the JSON form or a legacy "!TheSkyX" tab-separated dump.
    pub fn parse(text: &str) -> Result<Self, CanonicalError> {
        let trimmed = text.trim_start();
        if trimmed.starts_with(LEGACY_MARKER) {
            return RunArtifact::parse_legacy(trimmed);
        }
        let value: Value = serde_json::from_str(trimmed).map_err(|e| {
            invalid_argument_error(format!("Analyse file is not JSON: {}", e).as_str())
        })?;
        let Value::Object(columns) = value else {
            return Err(invalid_argument_error("Analyse file is not a JSON object"));
        };
        let artifact = RunArtifact { columns };
        artifact.validate()?;
        Ok(artifact)
    }

    // First line is the marker, second the tab-separated column names, then
    // one tab-separated row per point. Numeric cells become numbers.
    fn parse_legacy(text: &str) -> Result<Self, CanonicalError> {
        let mut lines = text.lines().skip(1).filter(|l| !l.trim().is_empty());
        let Some(header) = lines.next() else {
            return Err(invalid_argument_error("Legacy analyse file has no header"));
        };
        let names: Vec<String> = header.split('\t').map(|n| n.trim().to_string()).collect();
        let mut columns: Vec<Vec<Value>> = vec![Vec::new(); names.len()];
        for (row_number, line) in lines.enumerate() {
            let cells: Vec<&str> = line.split('\t').collect();
            if cells.len() != names.len() {
                return Err(invalid_argument_error(format!(
                    "Legacy row {} has {} cells, expected {}",
                    row_number + 1, cells.len(), names.len()).as_str()));
            }
            for (column, cell) in columns.iter_mut().zip(cells) {
                let cell = cell.trim();
                column.push(match cell.parse::<f64>() {
                    Ok(number) => Value::from(number),
                    Err(_) => Value::from(cell),
                });
            }
        }
        let columns = names.into_iter()
            .zip(columns)
            .map(|(name, values)| (name, Value::Array(values)))
            .collect();
        Ok(RunArtifact { columns })
    }

    pub fn load(path: &Path) -> Result<Self, CanonicalError> {
        let text = fs::read_to_string(path).map_err(|e| {
            failed_precondition_error(format!("Cannot read {:?}: {}", path, e).as_str())
        })?;
        RunArtifact::parse(&text)
    }
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use approx::assert_abs_diff_eq;

    use super::*;

    fn frame(index: usize) -> SolvedFrame {
        SolvedFrame {
            index,
            azimuth: 10.0 * index as f64,
            altitude: 45.0,
            ra_j2000: 100.0,
            ra_j2000_solved: 100.001,
            ra_error: 3.6,
            model_error: 3.6,
            pier_side: 'W',
            local_sidereal_time: "12:00:00.00".to_string(),
            local_sidereal_hours: 12.0,
            sub_frame: if index == 1 {
                Some(SubFrame { off_x: 10, off_y: 20, size_x: 100, size_y: 50 })
            } else {
                None
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_columns() {
        let artifact = RunArtifact::from_frames(&[frame(0), frame(2), frame(3)]);
        assert_eq!(artifact.len(), 3);
        for name in REQUIRED_COLUMNS {
            assert_eq!(artifact.column(name).unwrap().len(), 3, "{}", name);
        }
        assert_eq!(artifact.column_f64("Index").unwrap(), vec![0.0, 2.0, 3.0]);
        assert_eq!(artifact.column("Pierside").unwrap()[0], "W");
        assert!(artifact.column("OffX").unwrap()[0].is_null());
        assert!(artifact.validate().is_ok());

        let empty = RunArtifact::empty();
        assert!(empty.is_empty());
        assert!(empty.column("ModelError").unwrap().is_empty());
    }

    #[test]
    fn test_json_is_single_line() {
        let artifact = RunArtifact::from_frames(&[frame(0), frame(1)]);
        let json = artifact.to_json();
        assert!(!json.contains('\n'));
        let parsed = RunArtifact::parse(&json).unwrap();
        assert_eq!(parsed, artifact);
        assert_eq!(parsed.column("OffX").unwrap()[1], 10);
    }

    #[test]
    fn test_write_atomic() {
        let dir = std::env::temp_dir().join(format!("analyse_{}", std::process::id()));
        let path = dir.join("sub").join("run.model");
        let artifact = RunArtifact::from_frames(&[frame(0)]);
        artifact.write_atomic(&path).unwrap();
        assert!(!dir.join("sub").join("run.model.tmp").exists());
        let loaded = RunArtifact::load(&path).unwrap();
        assert_abs_diff_eq!(loaded.column_f64("RaError").unwrap()[0], 3.6, epsilon = 1e-12);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_legacy() {
        let text = "!TheSkyX export\nIndex\tRaError\tPierside\n0\t1.5\tE\n1\t-2.25\tW\n";
        let artifact = RunArtifact::parse(text).unwrap();
        assert_eq!(artifact.len(), 2);
        assert_eq!(artifact.column_f64("RaError").unwrap(), vec![1.5, -2.25]);
        assert_eq!(artifact.column("Pierside").unwrap()[1], "W");
        // Same shape as the JSON form.
        let again = RunArtifact::parse(&artifact.to_json()).unwrap();
        assert_eq!(again, artifact);

        assert!(RunArtifact::parse("!TheSkyX\nA\tB\n1\n").is_err());
        assert!(RunArtifact::parse("!TheSkyX\n").is_err());
    }

    #[test]
    fn test_rejects_ragged_json() {
        assert!(RunArtifact::parse(r#"{"A":[1,2],"B":[1]}"#).is_err());
        assert!(RunArtifact::parse(r#"{"A":3}"#).is_err());
        assert!(RunArtifact::parse("[1,2]").is_err());
        assert!(RunArtifact::parse("not json").is_err());
    }
}
