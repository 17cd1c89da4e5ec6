use crate::id::{component_matches, PathId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Sdual,
    Lbit,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Sdual => "sdual",
            ModelKind::Lbit => "lbit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DsetSize {
    Fix,
    Var,
}

/// A dataset to collect: realizations stack along `axis` in the target.
/// `Var` datasets take their leading extent from the `status` side table
/// instead of the source shape.
#[derive(Debug, Clone)]
pub struct DsetKey {
    pub algo: String,
    pub state: String,
    pub point: String,
    pub name: String,
    pub size: DsetSize,
    pub axis: usize,
}

#[derive(Debug, Clone)]
pub struct TableKey {
    pub algo: String,
    pub state: String,
    pub point: String,
    pub name: String,
}

/// A time-series table: rows are iterations of one realization, pivoted at
/// merge time into one target table per iteration.
#[derive(Debug, Clone)]
pub struct CronoKey {
    pub algo: String,
    pub state: String,
    pub point: String,
    pub name: String,
}

/// A family of small tables in subgroups named by bond dimension; only the
/// last record of each is collected.
#[derive(Debug, Clone)]
pub struct ScaleKey {
    pub algo: String,
    pub state: String,
    pub point: String,
    pub name: String,
    pub pattern: String,
}

#[derive(Debug, Clone)]
pub struct ModelKey {
    pub algo: String,
    pub model: String,
    pub name: String,
}

/// Everything one model variant collects. Declarative: the classifier
/// matches these patterns against each concrete source group.
#[derive(Debug, Clone)]
pub struct KeySet {
    pub kind: ModelKind,
    pub models: Vec<ModelKey>,
    pub dsets: Vec<DsetKey>,
    pub tables: Vec<TableKey>,
    pub cronos: Vec<CronoKey>,
    pub scales: Vec<ScaleKey>,
}

#[derive(Debug, Default)]
pub struct Classified<'a> {
    pub dsets: Vec<&'a DsetKey>,
    pub tables: Vec<&'a TableKey>,
    pub cronos: Vec<&'a CronoKey>,
    pub scales: Vec<&'a ScaleKey>,
}

impl KeySet {
    pub fn for_model(kind: ModelKind) -> KeySet {
        match kind {
            ModelKind::Sdual => sdual(),
            ModelKind::Lbit => lbit(),
        }
    }

    /// Buckets every key whose patterns match this source group.
    pub fn classify<'a>(&'a self, pathid: &PathId) -> Classified<'a> {
        Classified {
            dsets: self
                .dsets
                .iter()
                .filter(|k| pathid.matches(&k.algo, &k.state, &k.point))
                .collect(),
            tables: self
                .tables
                .iter()
                .filter(|k| pathid.matches(&k.algo, &k.state, &k.point))
                .collect(),
            cronos: self
                .cronos
                .iter()
                .filter(|k| pathid.matches(&k.algo, &k.state, &k.point))
                .collect(),
            scales: self
                .scales
                .iter()
                .filter(|k| pathid.matches(&k.algo, &k.state, &k.point))
                .collect(),
        }
    }

    pub fn model_keys_for(&self, algo: &str) -> Vec<&ModelKey> {
        self.models
            .iter()
            .filter(|k| component_matches(algo, &k.algo))
            .collect()
    }

    pub fn algo_patterns(&self) -> Vec<String> {
        let mut out = Vec::new();
        for pattern in self
            .models
            .iter()
            .map(|k| &k.algo)
            .chain(self.dsets.iter().map(|k| &k.algo))
            .chain(self.tables.iter().map(|k| &k.algo))
            .chain(self.cronos.iter().map(|k| &k.algo))
            .chain(self.scales.iter().map(|k| &k.algo))
        {
            if !out.contains(pattern) {
                out.push(pattern.clone());
            }
        }
        out
    }

    pub fn state_patterns(&self) -> Vec<String> {
        let mut out = Vec::new();
        for pattern in self
            .dsets
            .iter()
            .map(|k| &k.state)
            .chain(self.tables.iter().map(|k| &k.state))
            .chain(self.cronos.iter().map(|k| &k.state))
            .chain(self.scales.iter().map(|k| &k.state))
        {
            if !out.contains(pattern) {
                out.push(pattern.clone());
            }
        }
        out
    }

    pub fn point_patterns(&self) -> Vec<String> {
        let mut out = Vec::new();
        for pattern in self
            .dsets
            .iter()
            .map(|k| &k.point)
            .chain(self.tables.iter().map(|k| &k.point))
            .chain(self.cronos.iter().map(|k| &k.point))
            .chain(self.scales.iter().map(|k| &k.point))
        {
            if !out.contains(pattern) {
                out.push(pattern.clone());
            }
        }
        out
    }
}

fn sdual() -> KeySet {
    let algo = "xDMRG";
    let state = "state_*";
    let point = "finished";
    let dset = |name: &str, size: DsetSize| DsetKey {
        algo: algo.into(),
        state: state.into(),
        point: point.into(),
        name: name.into(),
        size,
        axis: 1,
    };
    let table = |name: &str| TableKey {
        algo: algo.into(),
        state: state.into(),
        point: point.into(),
        name: name.into(),
    };
    KeySet {
        kind: ModelKind::Sdual,
        models: vec![ModelKey { algo: algo.into(), model: "model".into(), name: "hamiltonian".into() }],
        dsets: vec![
            dset("bond_dimensions", DsetSize::Fix),
            dset("entanglement_entropies", DsetSize::Fix),
            dset("truncation_errors", DsetSize::Fix),
            dset("schmidt_midchain", DsetSize::Var),
        ],
        tables: vec![table("measurements"), table("status"), table("mem_usage")],
        cronos: Vec::new(),
        scales: Vec::new(),
    }
}

fn lbit() -> KeySet {
    let algo = "fLBIT";
    let state = "state_*";
    let point = "finished";
    KeySet {
        kind: ModelKind::Lbit,
        models: vec![ModelKey { algo: algo.into(), model: "model".into(), name: "hamiltonian".into() }],
        dsets: Vec::new(),
        tables: vec![
            TableKey {
                algo: algo.into(),
                state: state.into(),
                point: point.into(),
                name: "status".into(),
            },
            TableKey {
                algo: algo.into(),
                state: state.into(),
                point: point.into(),
                name: "mem_usage".into(),
            },
        ],
        cronos: vec![CronoKey {
            algo: algo.into(),
            state: state.into(),
            point: point.into(),
            name: "measurements".into(),
        }],
        scales: vec![ScaleKey {
            algo: algo.into(),
            state: state.into(),
            point: point.into(),
            name: "measurements".into(),
            pattern: "chi_*".into(),
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sdual_classification_hits_finished_states_only() {
        let keys = KeySet::for_model(ModelKind::Sdual);
        let hit = PathId::new("base", "xDMRG", "state_1", "finished");
        let classified = keys.classify(&hit);
        assert_eq!(classified.dsets.len(), 4);
        assert_eq!(classified.tables.len(), 3);
        assert!(classified.cronos.is_empty());

        let checkpoint = PathId::new("base", "xDMRG", "state_1", "checkpoint");
        let classified = keys.classify(&checkpoint);
        assert!(classified.dsets.is_empty());
        assert!(classified.tables.is_empty());
    }

    #[test]
    fn lbit_collects_cronos_and_scales() {
        let keys = KeySet::for_model(ModelKind::Lbit);
        let hit = PathId::new("base", "fLBIT", "state_real", "finished");
        let classified = keys.classify(&hit);
        assert_eq!(classified.cronos.len(), 1);
        assert_eq!(classified.scales.len(), 1);
        assert_eq!(classified.tables.len(), 2);
    }

    #[test]
    fn pattern_lists_are_deduplicated() {
        let keys = KeySet::for_model(ModelKind::Sdual);
        assert_eq!(keys.algo_patterns(), ["xDMRG"]);
        assert_eq!(keys.state_patterns(), ["state_*"]);
        assert_eq!(keys.point_patterns(), ["finished"]);
    }
}
