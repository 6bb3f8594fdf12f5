//! Graphs and datasets the pattern matcher reads from.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::query::term::Term;

/// Ground triple.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Triple {
    /// Subject.
    pub subject: Term,
    /// Predicate.
    pub predicate: Term,
    /// Object.
    pub object: Term,
}

impl Triple {
    /// Creates a triple.
    pub fn new(subject: Term, predicate: Term, object: Term) -> Self {
        Self {
            subject,
            predicate,
            object,
        }
    }
}

/// Read-only triple store.
pub trait Graph: fmt::Debug + Send + Sync {
    /// Triples matching the given slots; `None` is a wildcard.
    fn find(&self, s: Option<&Term>, p: Option<&Term>, o: Option<&Term>) -> Vec<Triple>;

    /// Every subject and object in the graph.
    fn nodes(&self) -> Vec<Term>;
}

/// Default graph plus named graphs.
pub trait Dataset: fmt::Debug + Send + Sync {
    /// Graph used when no GRAPH clause is active.
    fn default_graph(&self) -> Arc<dyn Graph>;

    /// Named graph, if present.
    fn named_graph(&self, name: &Term) -> Option<Arc<dyn Graph>>;

    /// Names of every named graph, in a stable order.
    fn graph_names(&self) -> Vec<Term>;
}

/// Sorted in-memory triple set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InMemoryGraph {
    triples: BTreeSet<Triple>,
}

impl InMemoryGraph {
    /// Empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a triple; duplicates collapse.
    pub fn insert(&mut self, triple: Triple) {
        self.triples.insert(triple);
    }

    /// Builder-style insert.
    pub fn with_triple(mut self, subject: Term, predicate: Term, object: Term) -> Self {
        self.insert(Triple::new(subject, predicate, object));
        self
    }

    /// Number of triples.
    pub fn len(&self) -> usize {
        self.triples.len()
    }

    /// Returns true when the graph holds no triples.
    pub fn is_empty(&self) -> bool {
        self.triples.is_empty()
    }
}

impl FromIterator<Triple> for InMemoryGraph {
    fn from_iter<I: IntoIterator<Item = Triple>>(iter: I) -> Self {
        Self {
            triples: iter.into_iter().collect(),
        }
    }
}

impl Graph for InMemoryGraph {
    fn find(&self, s: Option<&Term>, p: Option<&Term>, o: Option<&Term>) -> Vec<Triple> {
        self.triples
            .iter()
            .filter(|t| s.map_or(true, |s| &t.subject == s))
            .filter(|t| p.map_or(true, |p| &t.predicate == p))
            .filter(|t| o.map_or(true, |o| &t.object == o))
            .cloned()
            .collect()
    }

    fn nodes(&self) -> Vec<Term> {
        let nodes: BTreeSet<&Term> = self
            .triples
            .iter()
            .flat_map(|t| [&t.subject, &t.object])
            .collect();
        nodes.into_iter().cloned().collect()
    }
}

/// Serialized form of [`InMemoryDataset`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DatasetDocument {
    /// Default graph triples.
    #[serde(default)]
    pub default: Vec<Triple>,
    /// Named graph triples keyed by graph IRI.
    #[serde(default)]
    pub named: BTreeMap<String, Vec<Triple>>,
}

/// In-memory dataset.
///
/// JSON form: `{"default": [triple...], "named": {"<iri>": [triple...]}}`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(from = "DatasetDocument", into = "DatasetDocument")]
pub struct InMemoryDataset {
    default: Arc<InMemoryGraph>,
    named: BTreeMap<Term, Arc<InMemoryGraph>>,
}

impl InMemoryDataset {
    /// Empty dataset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Dataset whose default graph is `graph`.
    pub fn from_graph(graph: InMemoryGraph) -> Self {
        Self {
            default: Arc::new(graph),
            named: BTreeMap::new(),
        }
    }

    /// Adds a triple to the default graph.
    pub fn with_triple(mut self, subject: Term, predicate: Term, object: Term) -> Self {
        Arc::make_mut(&mut self.default).insert(Triple::new(subject, predicate, object));
        self
    }

    /// Adds a triple to the named graph `name`, creating it if needed.
    pub fn with_named_triple(
        mut self,
        name: Term,
        subject: Term,
        predicate: Term,
        object: Term,
    ) -> Self {
        let graph = self.named.entry(name).or_default();
        Arc::make_mut(graph).insert(Triple::new(subject, predicate, object));
        self
    }

    /// Installs or replaces a named graph.
    pub fn with_named_graph(mut self, name: Term, graph: InMemoryGraph) -> Self {
        self.named.insert(name, Arc::new(graph));
        self
    }
}

impl Dataset for InMemoryDataset {
    fn default_graph(&self) -> Arc<dyn Graph> {
        self.default.clone()
    }

    fn named_graph(&self, name: &Term) -> Option<Arc<dyn Graph>> {
        self.named
            .get(name)
            .map(|graph| graph.clone() as Arc<dyn Graph>)
    }

    fn graph_names(&self) -> Vec<Term> {
        self.named.keys().cloned().collect()
    }
}

impl From<DatasetDocument> for InMemoryDataset {
    fn from(raw: DatasetDocument) -> Self {
        let default = raw.default.into_iter().collect::<InMemoryGraph>();
        let named = raw
            .named
            .into_iter()
            .map(|(name, triples)| {
                (
                    Term::iri(name),
                    Arc::new(triples.into_iter().collect::<InMemoryGraph>()),
                )
            })
            .collect();
        Self {
            default: Arc::new(default),
            named,
        }
    }
}

impl From<InMemoryDataset> for DatasetDocument {
    fn from(ds: InMemoryDataset) -> Self {
        let default = ds.default.triples.iter().cloned().collect();
        let named = ds
            .named
            .iter()
            .map(|(name, graph)| {
                (
                    name.lexical().to_owned(),
                    graph.triples.iter().cloned().collect(),
                )
            })
            .collect();
        DatasetDocument { default, named }
    }
}
