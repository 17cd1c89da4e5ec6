use std::collections::HashMap;

use h5mbl_store::{Dtype, Field, RecordType, StoreFile, TableInfo, Value};
use regex::Regex;
use tracing::{debug, warn};

use crate::error::Result;
use crate::id::{parent_dir, FileId, InfoId};
use crate::keys::{ModelKey, ModelKind};

pub const BASE_DECIMALS: usize = 4;

/// Physical parameters of the two model variants. The field names below
/// match the attribute and table-field names in the source files.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelParams {
    Sdual {
        j_mean: f64,
        j_stdv: f64,
        h_mean: f64,
        h_stdv: f64,
        lambda: f64,
        delta: f64,
    },
    Lbit {
        j1_mean: f64,
        j2_mean: f64,
        j3_mean: f64,
        j1_wdth: f64,
        j2_wdth: f64,
        j3_wdth: f64,
        j2_xcls: f64,
        j2_span: u64,
        f_mixer: f64,
        u_layer: u64,
    },
}

impl ModelParams {
    pub fn kind(&self) -> ModelKind {
        match self {
            ModelParams::Sdual { .. } => ModelKind::Sdual,
            ModelParams::Lbit { .. } => ModelKind::Lbit,
        }
    }

    /// Named values in declaration order, for the hamiltonian projection
    /// and the per-field scalar datasets.
    pub fn fields(&self) -> Vec<(&'static str, Value)> {
        match *self {
            ModelParams::Sdual { j_mean, j_stdv, h_mean, h_stdv, lambda, delta } => vec![
                ("J_mean", Value::F64(j_mean)),
                ("J_stdv", Value::F64(j_stdv)),
                ("h_mean", Value::F64(h_mean)),
                ("h_stdv", Value::F64(h_stdv)),
                ("lambda", Value::F64(lambda)),
                ("delta", Value::F64(delta)),
            ],
            ModelParams::Lbit {
                j1_mean,
                j2_mean,
                j3_mean,
                j1_wdth,
                j2_wdth,
                j3_wdth,
                j2_xcls,
                j2_span,
                f_mixer,
                u_layer,
            } => vec![
                ("J1_mean", Value::F64(j1_mean)),
                ("J2_mean", Value::F64(j2_mean)),
                ("J3_mean", Value::F64(j3_mean)),
                ("J1_wdth", Value::F64(j1_wdth)),
                ("J2_wdth", Value::F64(j2_wdth)),
                ("J3_wdth", Value::F64(j3_wdth)),
                ("J2_xcls", Value::F64(j2_xcls)),
                ("J2_span", Value::U64(j2_span)),
                ("f_mixer", Value::F64(f_mixer)),
                ("u_layer", Value::U64(u_layer)),
            ],
        }
    }

    pub fn record_type(&self) -> RecordType {
        RecordType::new(
            self.fields()
                .iter()
                .map(|(name, value)| {
                    let dtype = match value {
                        Value::U64(_) => Dtype::U64,
                        _ => Dtype::F64,
                    };
                    Field::new(*name, dtype)
                })
                .collect(),
        )
    }

    pub fn encode_record(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (_, value) in self.fields() {
            match value {
                Value::F64(v) => out.extend_from_slice(&v.to_le_bytes()),
                Value::U64(v) => out.extend_from_slice(&v.to_le_bytes()),
                _ => unreachable!("model params are numeric"),
            }
        }
        out
    }
}

/// One physical parameter point as read from a source file. `basepath` is
/// the deterministic grouping key: every realization with equal params
/// merges under it.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelId {
    pub params: ModelParams,
    pub model_size: u64,
    pub model_type: String,
    pub distribution: String,
    pub algorithm: String,
    pub key: String,
    pub path: String,
    pub basepath: String,
}

/// Standardized target base for a parameter point. Deterministic and
/// total: equal params give byte-equal strings.
pub fn standardized_base(model: &ModelId, decimals: usize) -> String {
    match &model.params {
        ModelParams::Sdual { lambda, delta, .. } => format!(
            "L_{}/l_{lambda:.dec$}/d_{delta:+.dec$}",
            model.model_size,
            dec = decimals
        ),
        ModelParams::Lbit {
            j1_mean,
            j2_mean,
            j3_mean,
            j1_wdth,
            j2_wdth,
            j3_wdth,
            j2_xcls,
            j2_span,
            f_mixer,
            u_layer,
        } => {
            // J2_span == u64::MAX labels infinite interaction range.
            let span = if *j2_span == u64::MAX {
                "r_L".to_string()
            } else {
                format!("r_{j2_span}")
            };
            format!(
                "L_{}/J[{j1_mean:+.dec$}_{j2_mean:+.dec$}_{j3_mean:+.dec$}]/w[{j1_wdth:+.dec$}_{j2_wdth:+.dec$}_{j3_wdth:+.dec$}]/x_{j2_xcls:.dec$}/f_{f_mixer:.dec$}/u_{u_layer}/{span}",
                model.model_size,
                dec = decimals
            )
        }
    }
}

/// Parses a `<label>_<number>` fragment (also `<label><signed>`, e.g.
/// `f+0.20`) out of a path. Used when a hamiltonian attribute is absent.
pub fn label_value(text: &str, label: &str) -> Option<f64> {
    let pattern = format!(
        r"(?:^|[/_\[(]){}_?([+-]?[0-9]+(?:\.[0-9]+)?)",
        regex::escape(label)
    );
    let re = Regex::new(&pattern).ok()?;
    re.captures(text)?.get(1)?.as_str().parse().ok()
}

/// Like `label_value` for the interaction range, where `r_L` labels an
/// infinite range.
pub fn label_span(text: &str) -> Option<u64> {
    let re = Regex::new(r"(?:^|[/_\[(])r_?(L|[0-9]+)").ok()?;
    match re.captures(text)?.get(1)?.as_str() {
        "L" => Some(u64::MAX),
        digits => digits.parse().ok(),
    }
}

fn param_f64(src: &StoreFile, path: &str, attr: &str, fallback: &str, label: &str) -> f64 {
    if let Ok(v) = src.read_attr_f64(path, attr) {
        return v;
    }
    if let Some(v) = label_value(fallback, label) {
        debug!("parameter {attr} recovered from filename as {v}");
        return v;
    }
    warn!("parameter {attr} missing from [{path}] and filename, assuming 0");
    0.0
}

fn param_u64(src: &StoreFile, path: &str, attr: &str, fallback: &str, label: &str) -> u64 {
    if let Ok(v) = src.read_attr_u64(path, attr) {
        return v;
    }
    if let Some(v) = label_value(fallback, label) {
        debug!("parameter {attr} recovered from filename as {v}");
        return v as u64;
    }
    warn!("parameter {attr} missing from [{path}] and filename, assuming 0");
    0
}

/// Reads the hamiltonian parameters of one algorithm group, memoized per
/// source directory. Returns the cache key, or `None` when this file has
/// no hamiltonian to read.
pub fn load_model(
    src: &StoreFile,
    src_model_db: &mut HashMap<String, ModelId>,
    kind: ModelKind,
    key: &ModelKey,
    algo: &str,
) -> Result<Option<String>> {
    let model_path = format!("{algo}/{}/{}", key.model, key.name);
    let model_key = format!("{}|{algo}", parent_dir(src.path()));
    if src_model_db.contains_key(&model_key) {
        return Ok(Some(model_key));
    }
    if !src.link_exists(&model_path) {
        return Ok(None);
    }
    let fname = src.path().to_string_lossy().into_owned();
    let Some(model_size) = src
        .read_attr_u64(&model_path, "model_size")
        .ok()
        .or_else(|| label_value(&fname, "L").map(|v| v as u64))
    else {
        warn!("cannot determine model_size for [{model_path}] in {fname}");
        return Ok(None);
    };
    let params = match kind {
        ModelKind::Sdual => ModelParams::Sdual {
            j_mean: param_f64(src, &model_path, "J_mean", &fname, "J"),
            j_stdv: param_f64(src, &model_path, "J_stdv", &fname, "J_stdv"),
            h_mean: param_f64(src, &model_path, "h_mean", &fname, "h"),
            h_stdv: param_f64(src, &model_path, "h_stdv", &fname, "h_stdv"),
            lambda: param_f64(src, &model_path, "lambda", &fname, "l"),
            delta: param_f64(src, &model_path, "delta", &fname, "d"),
        },
        ModelKind::Lbit => ModelParams::Lbit {
            j1_mean: param_f64(src, &model_path, "J1_mean", &fname, "J1_mean"),
            j2_mean: param_f64(src, &model_path, "J2_mean", &fname, "J2_mean"),
            j3_mean: param_f64(src, &model_path, "J3_mean", &fname, "J3_mean"),
            j1_wdth: param_f64(src, &model_path, "J1_wdth", &fname, "J1_wdth"),
            j2_wdth: param_f64(src, &model_path, "J2_wdth", &fname, "J2_wdth"),
            j3_wdth: param_f64(src, &model_path, "J3_wdth", &fname, "J3_wdth"),
            j2_xcls: param_f64(src, &model_path, "J2_xcls", &fname, "x"),
            j2_span: src
                .read_attr_u64(&model_path, "J2_span")
                .ok()
                .or_else(|| label_span(&fname))
                .unwrap_or(u64::MAX),
            f_mixer: param_f64(src, &model_path, "f_mixer", &fname, "f"),
            u_layer: param_u64(src, &model_path, "u_layer", &fname, "u"),
        },
    };
    let model_type = src
        .read_attr_str(&model_path, "model_type")
        .unwrap_or_else(|_| kind.as_str().to_string());
    let distribution = src
        .read_attr_str(&model_path, "distribution")
        .unwrap_or_default();
    let mut model = ModelId {
        params,
        model_size,
        model_type,
        distribution,
        algorithm: algo.to_string(),
        key: model_key.clone(),
        path: model_path,
        basepath: String::new(),
    };
    model.basepath = standardized_base(&model, BASE_DECIMALS);
    debug!("loaded model {} -> {}", model.key, model.basepath);
    src_model_db.insert(model_key.clone(), model);
    Ok(Some(model_key))
}

/// Writes the parameter point into the target the first time its basepath
/// shows up: a hamiltonian table holding just the parameter fields, plus
/// one scalar dataset per field for convenient slicing.
pub fn save_model(
    tgt: &mut StoreFile,
    tgt_model_db: &mut HashMap<String, InfoId<TableInfo>>,
    model: &ModelId,
    file_id: &FileId,
) -> Result<()> {
    let base = &model.basepath;
    let algo = &model.algorithm;
    let table_path = format!("{base}/{algo}/model/hamiltonian");
    if tgt_model_db.contains_key(&table_path) {
        return Ok(());
    }
    let mut info = tgt.create_table(
        &table_path,
        model.params.record_type(),
        "Hamiltonian parameters",
        100,
        4,
    )?;
    if info.num_records.unwrap_or(0) == 0 {
        tgt.write_table_records(&mut info, 0, &model.params.encode_record())?;
    }
    tgt.write_scalar(
        &format!("{base}/{algo}/model/model_size"),
        Value::U64(model.model_size),
    )?;
    tgt.write_scalar(
        &format!("{base}/{algo}/model/model_type"),
        Value::Str(model.model_type.clone()),
    )?;
    tgt.write_scalar(
        &format!("{base}/{algo}/model/distribution"),
        Value::Str(model.distribution.clone()),
    )?;
    for (name, value) in model.params.fields() {
        tgt.write_scalar(&format!("{base}/{algo}/model/{name}"), value)?;
    }
    let mut id = InfoId::new(info);
    id.insert(file_id.seed, 0);
    tgt_model_db.insert(table_path, id);
    Ok(())
}
