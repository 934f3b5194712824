//! Checkpoint loading with tolerant, name-based parameter binding.
//!
//! Checkpoints written by a `torch.compile`-wrapped model carry the
//! [`LEGACY_PREFIX`] on every parameter name. Names are normalized before
//! binding, then every parameter that exists on both sides with the same
//! shape is copied. Everything else is reported, never fatal.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;
use tracing::{info, warn};

pub const LEGACY_PREFIX: &str = "_orig_mod.";

/// Outcome of binding a checkpoint to a freshly built model.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoadReport {
    /// Keys rewritten by stripping [`LEGACY_PREFIX`].
    pub renamed: usize,
    pub loaded: usize,
    /// Model parameters absent from the checkpoint; left at initial values.
    pub missing: Vec<String>,
    /// Checkpoint entries with no matching model parameter; dropped.
    pub unexpected: Vec<String>,
    /// Present on both sides with different shapes; dropped.
    pub mismatched: Vec<String>,
}

impl LoadReport {
    pub fn is_exact(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty() && self.mismatched.is_empty()
    }

    pub fn log(&self) {
        info!(
            loaded = self.loaded,
            renamed = self.renamed,
            exact = self.is_exact(),
            "checkpoint parameters bound"
        );
        if !self.missing.is_empty() {
            warn!(count = self.missing.len(), names = ?self.missing, "parameters missing from checkpoint keep their initial values");
        }
        if !self.unexpected.is_empty() {
            warn!(count = self.unexpected.len(), names = ?self.unexpected, "checkpoint entries match no model parameter and were ignored");
        }
        if !self.mismatched.is_empty() {
            warn!(count = self.mismatched.len(), names = ?self.mismatched, "checkpoint entries have the wrong shape and were ignored");
        }
    }
}

/// Rewrites every key starting with [`LEGACY_PREFIX`] without it, keeping the
/// value. When the stripped name collides with an existing key, the entry
/// that carried the prefix wins. Returns the entries and the rename count.
pub fn strip_legacy_prefix<V>(entries: Vec<(String, V)>) -> (Vec<(String, V)>, usize) {
    let mut out: Vec<(String, V)> = Vec::with_capacity(entries.len());
    let mut positions: HashMap<String, usize> = HashMap::with_capacity(entries.len());
    let mut prefixed = Vec::new();

    for (name, value) in entries {
        match name.strip_prefix(LEGACY_PREFIX) {
            Some(stripped) => prefixed.push((stripped.to_string(), value)),
            None => {
                positions.insert(name.clone(), out.len());
                out.push((name, value));
            }
        }
    }

    let renamed = prefixed.len();
    for (name, value) in prefixed {
        match positions.get(&name) {
            Some(&idx) => out[idx].1 = value,
            None => {
                positions.insert(name.clone(), out.len());
                out.push((name, value));
            }
        }
    }

    (out, renamed)
}

/// Matches checkpoint entries against the model's expected parameter shapes.
/// Returns the report and the set of names that can be copied.
pub fn reconcile<'a, I>(
    expected: &BTreeMap<String, Vec<i64>>,
    provided: I,
    renamed: usize,
) -> (LoadReport, HashSet<String>)
where
    I: IntoIterator<Item = (&'a str, Vec<i64>)>,
{
    let mut report = LoadReport {
        renamed,
        ..LoadReport::default()
    };
    let mut assignable = HashSet::new();
    let mut seen = HashSet::new();

    for (name, shape) in provided {
        seen.insert(name);
        match expected.get(name) {
            Some(want) if *want == shape => {
                assignable.insert(name.to_string());
            }
            Some(_) => report.mismatched.push(name.to_string()),
            None => report.unexpected.push(name.to_string()),
        }
    }

    report.missing = expected
        .keys()
        .filter(|name| !seen.contains(name.as_str()))
        .cloned()
        .collect();
    report.loaded = assignable.len();
    report.unexpected.sort();
    report.mismatched.sort();

    (report, assignable)
}

#[cfg(feature = "tch-backend")]
pub use self::torch::load;

#[cfg(feature = "tch-backend")]
mod torch {
    use std::{collections::BTreeMap, fs::File, path::Path};

    use tch::{Device, Tensor};

    use super::{LoadReport, reconcile, strip_legacy_prefix};
    use crate::{
        error::ServiceError,
        model::{ModelConfig, transformer::Transformer},
    };

    /// Reads the checkpoint at `path`, normalizes its names and binds it to a
    /// new [`Transformer`] on `device`. The returned model is frozen.
    pub fn load(
        path: &Path,
        config: &ModelConfig,
        device: Device,
    ) -> Result<(Transformer, LoadReport), ServiceError> {
        if !path.is_file() || File::open(path).is_err() {
            return Err(ServiceError::CheckpointNotFound(path.to_path_buf()));
        }

        let raw = read_weights(path, device)?;
        let (entries, renamed) = strip_legacy_prefix(raw);

        let mut model = Transformer::new(config, device)?;
        let mut variables = model.var_store().variables();
        let expected: BTreeMap<String, Vec<i64>> = variables
            .iter()
            .map(|(name, tensor)| (name.clone(), tensor.size()))
            .collect();

        let (report, assignable) = reconcile(
            &expected,
            entries.iter().map(|(name, t)| (name.as_str(), t.size())),
            renamed,
        );

        tch::no_grad(|| -> Result<(), ServiceError> {
            for (name, tensor) in &entries {
                if !assignable.contains(name) {
                    continue;
                }
                if let Some(var) = variables.get_mut(name) {
                    var.f_copy_(tensor)?;
                }
            }
            Ok(())
        })?;

        model.var_store_mut().freeze();
        report.log();

        Ok((model, report))
    }

    fn read_weights(path: &Path, device: Device) -> Result<Vec<(String, Tensor)>, ServiceError> {
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        let weights = match extension {
            "safetensors" => Tensor::read_safetensors(path),
            "ot" => Tensor::load_multi_with_device(path, device),
            _ => Tensor::loadz_multi_with_device(path, device),
        };
        weights.map_err(|e| ServiceError::Checkpoint(format!("{}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_prefix_losslessly() {
        let entries = vec![
            ("_orig_mod.layer1.weight".to_string(), vec![1.0f32, 2.0]),
            ("norm.weight".to_string(), vec![3.0]),
        ];
        let (out, renamed) = strip_legacy_prefix(entries);

        assert_eq!(renamed, 1);
        let map: HashMap<_, _> = out.into_iter().collect();
        assert_eq!(map.get("layer1.weight"), Some(&vec![1.0, 2.0]));
        assert_eq!(map.get("norm.weight"), Some(&vec![3.0]));
        assert!(!map.contains_key("_orig_mod.layer1.weight"));
    }

    #[test]
    fn prefixed_entry_wins_on_collision() {
        let entries = vec![
            ("_orig_mod.output.weight".to_string(), "compiled"),
            ("output.weight".to_string(), "plain"),
        ];
        let (out, _) = strip_legacy_prefix(entries);
        assert_eq!(out, vec![("output.weight".to_string(), "compiled")]);
    }

    #[test]
    fn only_leading_prefix_is_stripped() {
        let entries = vec![("layers._orig_mod.w".to_string(), 0u8)];
        let (out, renamed) = strip_legacy_prefix(entries);
        assert_eq!(renamed, 0);
        assert_eq!(out[0].0, "layers._orig_mod.w");
    }

    #[test]
    fn reconcile_is_tolerant() {
        let expected: BTreeMap<String, Vec<i64>> = [
            ("tok_embeddings.weight".to_string(), vec![10, 4]),
            ("norm.weight".to_string(), vec![4]),
            ("output.weight".to_string(), vec![10, 4]),
        ]
        .into_iter()
        .collect();

        let provided = vec![
            ("tok_embeddings.weight", vec![10, 4]),
            ("norm.weight", vec![8]),
            ("rope.freqs", vec![2]),
        ];
        let (report, assignable) = reconcile(&expected, provided, 2);

        assert_eq!(report.renamed, 2);
        assert_eq!(report.loaded, 1);
        assert!(assignable.contains("tok_embeddings.weight"));
        assert_eq!(report.mismatched, vec!["norm.weight".to_string()]);
        assert_eq!(report.unexpected, vec!["rope.freqs".to_string()]);
        assert_eq!(report.missing, vec!["output.weight".to_string()]);
        assert!(!report.is_exact());
    }
}
