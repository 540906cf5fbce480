use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const MAPPING_FILE: &str = "breed_mapping.txt";
pub const CLASSES_FILE: &str = "classes.json";

/// Index-to-breed table. Network output `i` is `classes[i]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreedMapping {
    pub classes: Vec<String>,
}

impl BreedMapping {
    pub fn new(classes: Vec<String>) -> Self {
        Self { classes }
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn label(&self, index: usize) -> Result<&str> {
        self.classes
            .get(index)
            .map(String::as_str)
            .ok_or(Error::UnknownClass {
                index,
                count: self.classes.len(),
            })
    }

    pub fn index_of(&self, breed: &str) -> Option<usize> {
        self.classes.iter().position(|c| c == breed)
    }

    /// Writes `idx\tbreed` lines.
    pub fn write_tsv(&self, path: &Path) -> Result<()> {
        let body: String = self
            .classes
            .iter()
            .enumerate()
            .map(|(idx, breed)| format!("{idx}\t{breed}\n"))
            .collect();
        fs::write(path, body)?;
        Ok(())
    }

    pub fn read_tsv(path: &Path) -> Result<Self> {
        let body = fs::read_to_string(path)?;
        let mut classes = Vec::new();

        for (line_no, line) in body.lines().enumerate().filter(|(_, l)| !l.trim().is_empty()) {
            let (idx, breed) = line.split_once('\t').ok_or_else(|| Error::Mapping {
                line: line_no + 1,
                reason: "missing tab separator".to_string(),
            })?;
            let idx: usize = idx.trim().parse().map_err(|_| Error::Mapping {
                line: line_no + 1,
                reason: format!("'{idx}' is not an index"),
            })?;
            if idx != classes.len() {
                return Err(Error::Mapping {
                    line: line_no + 1,
                    reason: format!("expected index {}, found {idx}", classes.len()),
                });
            }
            classes.push(breed.to_string());
        }

        Ok(Self { classes })
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn read_json(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::PathNotFound(path.to_path_buf()));
        }
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping() -> BreedMapping {
        BreedMapping::new(vec![
            "Abyssinian".to_string(),
            "Maine Coon".to_string(),
            "Siamese".to_string(),
        ])
    }

    #[test]
    fn tsv_file_keeps_names_with_spaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(MAPPING_FILE);
        mapping().write_tsv(&path).unwrap();

        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "0\tAbyssinian\n1\tMaine Coon\n2\tSiamese\n"
        );
        assert_eq!(BreedMapping::read_tsv(&path).unwrap(), mapping());
    }

    #[test]
    fn tsv_rejects_gaps_in_indices() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(MAPPING_FILE);
        fs::write(&path, "0\tBengal\n2\tSphynx\n").unwrap();

        assert!(matches!(
            BreedMapping::read_tsv(&path),
            Err(Error::Mapping { line: 2, .. })
        ));
    }

    #[test]
    fn json_uses_classes_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CLASSES_FILE);
        mapping().write_json(&path).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["classes"][1], "Maine Coon");
        assert_eq!(BreedMapping::read_json(&path).unwrap(), mapping());
    }

    #[test]
    fn label_out_of_range() {
        assert_eq!(mapping().label(2).unwrap(), "Siamese");
        assert!(mapping().label(3).is_err());
        assert_eq!(mapping().index_of("Maine Coon"), Some(1));
    }
}
