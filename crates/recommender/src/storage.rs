//! Artifact cache
//!
//! Stages hand their outputs to each other through files: tables as
//! tab-separated text, matrices and models as bincode blobs, metrics as JSON.

use crate::types::{LineItem, ModelKind, Target};
use basket_recs_core::{PathsConfig, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Named pipeline artifacts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Artifact {
    Rpi,
    Candidates,
    ModelCandidates(ModelKind),
    Prices,
    Quantities,
    CandidatesWithFeatures,
    Recommendations,
    Spmat,
    SpmatNorm,
    ImplicitModels,
    Encoders,
    Ranker,
    CommonMetrics,
    CandidatesMetrics,
}

impl Artifact {
    /// Schema key, e.g. `data.candidates_bm25`
    pub fn key(&self) -> String {
        match self {
            Artifact::Rpi => "data.rpi".to_string(),
            Artifact::Candidates => "data.candidates".to_string(),
            Artifact::ModelCandidates(kind) => format!("data.candidates_{kind}"),
            Artifact::Prices => "data.prices".to_string(),
            Artifact::Quantities => "data.quantities".to_string(),
            Artifact::CandidatesWithFeatures => "data.candidates_with_features".to_string(),
            Artifact::Recommendations => "data.recommendations".to_string(),
            Artifact::Spmat => "models.spmat".to_string(),
            Artifact::SpmatNorm => "models.spmat_norm".to_string(),
            Artifact::ImplicitModels => "models.implicit_models".to_string(),
            Artifact::Encoders => "models.encoders".to_string(),
            Artifact::Ranker => "models.ranker".to_string(),
            Artifact::CommonMetrics => "metrics.common".to_string(),
            Artifact::CandidatesMetrics => "metrics.candidates".to_string(),
        }
    }

    fn file_name(&self) -> String {
        match self {
            Artifact::Rpi => "rpi.tsv".to_string(),
            Artifact::Candidates => "candidates.tsv".to_string(),
            Artifact::ModelCandidates(kind) => format!("candidates_{kind}.tsv"),
            Artifact::Prices => "prices.tsv".to_string(),
            Artifact::Quantities => "quantities.tsv".to_string(),
            Artifact::CandidatesWithFeatures => "candidates_with_features.tsv".to_string(),
            Artifact::Recommendations => "recommendations.tsv".to_string(),
            Artifact::Spmat => "spmat.bin".to_string(),
            Artifact::SpmatNorm => "spmat_norm.bin".to_string(),
            Artifact::ImplicitModels => "implicit_models.bin".to_string(),
            Artifact::Encoders => "encoders.bin".to_string(),
            Artifact::Ranker => "rank_model.bin".to_string(),
            Artifact::CommonMetrics => "common_metrics.json".to_string(),
            Artifact::CandidatesMetrics => "candidates_metrics.json".to_string(),
        }
    }

    /// Data tables live in the cache, everything else in the export directory
    fn in_cache(&self) -> bool {
        matches!(
            self,
            Artifact::Rpi
                | Artifact::Candidates
                | Artifact::ModelCandidates(_)
                | Artifact::Prices
                | Artifact::Quantities
                | Artifact::CandidatesWithFeatures
                | Artifact::Recommendations
        )
    }
}

/// Resolves artifacts to files under the configured directories
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    cache_dir: PathBuf,
    export_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(paths: &PathsConfig) -> Self {
        Self {
            cache_dir: paths.cache_dir.clone(),
            export_dir: paths.export_dir.clone(),
        }
    }

    pub fn path(&self, artifact: Artifact) -> PathBuf {
        let dir = if artifact.in_cache() {
            &self.cache_dir
        } else {
            &self.export_dir
        };
        dir.join(artifact.file_name())
    }

    pub fn exists(&self, artifact: Artifact) -> bool {
        self.path(artifact).is_file()
    }

    pub fn save_table<T: Serialize>(&self, artifact: Artifact, rows: &[T]) -> Result<()> {
        let path = self.prepare(artifact)?;
        write_table(&path, rows)?;
        debug!(artifact = %artifact.key(), rows = rows.len(), "Saved table");
        Ok(())
    }

    pub fn load_table<T: DeserializeOwned>(&self, artifact: Artifact) -> Result<Vec<T>> {
        read_table(&self.path(artifact))
    }

    pub fn save_blob<T: Serialize>(&self, artifact: Artifact, value: &T) -> Result<()> {
        let path = self.prepare(artifact)?;
        let mut writer = BufWriter::new(File::create(&path)?);
        bincode::serialize_into(&mut writer, value)?;
        writer.flush()?;
        debug!(artifact = %artifact.key(), "Saved blob");
        Ok(())
    }

    pub fn load_blob<T: DeserializeOwned>(&self, artifact: Artifact) -> Result<T> {
        let reader = BufReader::new(File::open(self.path(artifact))?);
        Ok(bincode::deserialize_from(reader)?)
    }

    pub fn save_json<T: Serialize>(&self, artifact: Artifact, value: &T) -> Result<()> {
        let path = self.prepare(artifact)?;
        let mut writer = BufWriter::new(File::create(&path)?);
        serde_json::to_writer_pretty(&mut writer, value)?;
        writer.flush()?;
        debug!(artifact = %artifact.key(), "Saved metrics");
        Ok(())
    }

    pub fn load_json<T: DeserializeOwned>(&self, artifact: Artifact) -> Result<T> {
        let reader = BufReader::new(File::open(self.path(artifact))?);
        Ok(serde_json::from_reader(reader)?)
    }

    fn prepare(&self, artifact: Artifact) -> Result<PathBuf> {
        let path = self.path(artifact);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(path)
    }
}

fn tsv_reader(path: &Path) -> Result<csv::Reader<File>> {
    Ok(csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_path(path)?)
}

/// Tab-separated table with a header row
pub fn read_table<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let mut reader = tsv_reader(path)?;
    let mut rows = Vec::new();
    for row in reader.deserialize() {
        rows.push(row?);
    }
    Ok(rows)
}

pub fn write_table<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Raw line items; unknown columns are ignored and empty quantities read as null
pub fn read_line_items(path: &Path) -> Result<Vec<LineItem>> {
    let items: Vec<LineItem> = read_table(path)?;
    debug!(path = %path.display(), rows = items.len(), "Read line items");
    Ok(items)
}

/// Held-out `receipt_id`/`item_id` pairs
pub fn read_targets(path: &Path) -> Result<Vec<Target>> {
    read_table(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{CandidateFeatureRow, CandidateFeatures, FeatureVector, NUM_FEATURES};
    use crate::types::Candidate;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> ArtifactStore {
        ArtifactStore::new(&PathsConfig {
            cache_dir: dir.path().join("cache"),
            export_dir: dir.path().join("export"),
        })
    }

    #[test]
    fn test_read_line_items_tsv() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lines.tsv");
        fs::write(
            &path,
            "receipt_id\titem_id\tquantity\tprice\tname\textra\n\
             1\t10\t2\t3.5\tmilk\tx\n\
             1\t20\t\t\t\ty\n",
        )
        .unwrap();

        let items = read_line_items(&path).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].quantity, Some(2.0));
        assert_eq!(items[0].price, Some(3.5));
        assert_eq!(items[0].name.as_deref(), Some("milk"));
        assert_eq!(items[1].quantity, None);
        assert_eq!(items[1].price, None);
    }

    #[test]
    fn test_artifact_locations() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert_eq!(
            store.path(Artifact::ModelCandidates(ModelKind::Tfidf)),
            dir.path().join("cache").join("candidates_tfidf.tsv")
        );
        assert_eq!(
            store.path(Artifact::Encoders),
            dir.path().join("export").join("encoders.bin")
        );
        assert_eq!(Artifact::ModelCandidates(ModelKind::Als).key(), "data.candidates_als");
    }

    #[test]
    fn test_table_blob_and_json() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let rows = vec![Candidate {
            receipt_id: -4,
            item_id: 9_007_199_254_740_993,
            model_name: ModelKind::Cosine,
        }];
        store.save_table(Artifact::Candidates, &rows).unwrap();
        let loaded: Vec<Candidate> = store.load_table(Artifact::Candidates).unwrap();
        assert_eq!(loaded, rows);

        let blob: BTreeMap<i64, Vec<f32>> = [(1, vec![0.5, 1.5])].into_iter().collect();
        store.save_blob(Artifact::Spmat, &blob).unwrap();
        let loaded: BTreeMap<i64, Vec<f32>> = store.load_blob(Artifact::Spmat).unwrap();
        assert_eq!(loaded, blob);

        store.save_json(Artifact::CommonMetrics, &blob).unwrap();
        assert!(store.exists(Artifact::CommonMetrics));
        assert!(!store.exists(Artifact::Ranker));
    }

    #[test]
    fn test_missing_file_is_error() {
        let dir = TempDir::new().unwrap();
        assert!(store(&dir).load_blob::<Vec<u8>>(Artifact::Ranker).is_err());
    }

    #[test]
    fn test_feature_table_keeps_missing_values() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert_eq!(
            store.path(Artifact::CandidatesWithFeatures),
            dir.path().join("cache").join("candidates_with_features.tsv")
        );
        assert_eq!(
            Artifact::CandidatesWithFeatures.key(),
            "data.candidates_with_features"
        );

        let mut values = [None; NUM_FEATURES];
        values[0] = Some(2.5);
        values[3] = Some(1.0);
        let rows = vec![CandidateFeatureRow::from(&CandidateFeatures {
            receipt_id: 7,
            item_id: 30,
            features: FeatureVector(values),
        })];
        store.save_table(Artifact::CandidatesWithFeatures, &rows).unwrap();

        let loaded: Vec<CandidateFeatureRow> =
            store.load_table(Artifact::CandidatesWithFeatures).unwrap();
        assert_eq!(loaded, rows);
        assert_eq!(loaded[0].candidate_quantity, None);
        assert_eq!(loaded[0].candidate_price, Some(2.5));
    }
}
