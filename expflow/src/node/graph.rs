//! The dependency graph of one root node.
//!
//! Nodes live in an arena indexed by [`NodeId`], with a parent→children
//! index. The graph is built with an explicit stack instead of recursion;
//! the algorithm names currently on that stack are the in-progress set used
//! for cycle detection.

use crate::context::PipelineContext;
use crate::definition::{
    AlgorithmArtifact, AlgorithmDefinition, AlgorithmIdentity, DefinitionLayout, DependencySpec, ParameterVersion,
};
use crate::errors::{ConfigurationError, ExpflowResult};
use crate::schedule::CutoffWindow;
use chrono::NaiveDate;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Index of a node in a [`PipelineGraph`].
pub type NodeId = usize;

/// Where dependency definitions come from.
pub trait DefinitionSource {
    /// Loads the published definition of `algorithm_name`.
    fn load(&self, algorithm_name: &str) -> ExpflowResult<AlgorithmDefinition>;
}

impl DefinitionSource for AlgorithmArtifact {
    fn load(&self, algorithm_name: &str) -> ExpflowResult<AlgorithmDefinition> {
        self.read_definition(algorithm_name)
    }
}

/// A fully configured node.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphNode {
    /// Resolved definition, overrides applied.
    pub definition: AlgorithmDefinition,
    /// Typed step settings of the definition.
    pub layout: DefinitionLayout,
    /// Algorithm identity.
    pub identity: AlgorithmIdentity,
    /// Content hash of `definition`.
    pub definition_hash: String,
    /// Hash of `definition` and, in dependency order, every dependency's
    /// lineage hash. Equals `definition_hash` for a node without dependencies.
    pub lineage_hash: String,
    /// Artifact directory discriminator.
    pub parameter_version: ParameterVersion,
    /// Training cutoff.
    pub cutoff: Option<NaiveDate>,
    /// Train/test dates; absent without a cutoff.
    pub window: Option<CutoffWindow>,
    /// True when the parameter version was chosen by the caller.
    pub explicit_version: bool,
    /// True when a prebuilt predict-parameter package replaces training.
    pub prebuilt: bool,
    /// Output directory, exclusively owned by this node.
    pub output_dir: PathBuf,
    /// Metadata directory, exclusively owned by this node.
    pub metadata_dir: PathBuf,
}

impl GraphNode {
    fn configure(
        ctx: &PipelineContext,
        definition: AlgorithmDefinition,
        cutoff: Option<NaiveDate>,
        explicit: Option<&ParameterVersion>,
        prebuilt: bool,
    ) -> Result<Self, ConfigurationError> {
        let layout = definition.layout()?;
        let identity = definition.identity();
        let slug = identity.slug();

        let window = cutoff
            .map(|c| CutoffWindow::for_cutoff(c, layout.test_lag_days, layout.has_training()))
            .transpose()?;
        let parameter_version = match (explicit, &window) {
            (Some(version), _) => version.clone(),
            (None, Some(window)) => window.parameter_version(),
            (None, None) => {
                return Err(ConfigurationError::new(format!(
                    "{slug} needs either a cutoff or an explicit parameter version"
                )))
            }
        };

        if !prebuilt {
            let needs_data = layout.has_training() || !layout.feature_states.is_empty();
            if needs_data && cutoff.is_none() {
                return Err(ConfigurationError::new(format!(
                    "{slug} trains or generates feature states and therefore needs a cutoff"
                )));
            }
            if layout.has_training() && layout.train_data_location.is_none() {
                return Err(ConfigurationError::new(format!(
                    "{slug} declares training but no train_data_location"
                ))
                .with_key("train_data_location"));
            }
        }

        let definition_hash = definition.definition_hash();
        Ok(Self {
            lineage_hash: definition_hash.clone(),
            definition_hash,
            output_dir: ctx.output_base().join(&slug).join(parameter_version.as_str()),
            metadata_dir: ctx.metadata_base().join(&slug).join(parameter_version.as_str()),
            explicit_version: explicit.is_some(),
            definition,
            layout,
            identity,
            parameter_version,
            cutoff,
            window,
            prebuilt,
        })
    }

    /// Hyperparameter slug.
    #[must_use]
    pub fn slug(&self) -> String {
        self.identity.slug()
    }
}

struct Frame {
    id: NodeId,
    dependencies: Vec<DependencySpec>,
    next: usize,
}

/// Arena of the nodes reachable from one root.
#[derive(Debug, Clone)]
pub struct PipelineGraph {
    nodes: Vec<GraphNode>,
    children: Vec<Vec<(String, NodeId)>>,
    order: Vec<NodeId>,
}

impl PipelineGraph {
    /// Builds the graph below `root`.
    ///
    /// Dependencies share the root's cutoff. Without a cutoff they inherit the
    /// explicit parameter version. A prebuilt root needs no dependencies, so
    /// none are loaded.
    pub fn build(
        ctx: &PipelineContext,
        source: &dyn DefinitionSource,
        root: AlgorithmDefinition,
        cutoff: Option<NaiveDate>,
        explicit: Option<&ParameterVersion>,
        prebuilt: bool,
    ) -> ExpflowResult<Self> {
        let dependency_version = if cutoff.is_some() { None } else { explicit };
        let root = GraphNode::configure(ctx, root, cutoff, explicit, prebuilt)?;
        let root_dependencies = if prebuilt { Vec::new() } else { root.definition.dependencies()? };

        let mut graph = Self {
            nodes: Vec::new(),
            children: Vec::new(),
            order: Vec::new(),
        };
        let mut by_dir: HashMap<PathBuf, NodeId> = HashMap::new();
        by_dir.insert(root.output_dir.clone(), 0);
        graph.push(root);

        let mut stack = vec![Frame {
            id: 0,
            dependencies: root_dependencies,
            next: 0,
        }];

        while let Some(top) = stack.last_mut() {
            let Some(spec) = top.dependencies.get(top.next).cloned() else {
                graph.order.push(top.id);
                stack.pop();
                continue;
            };
            top.next += 1;
            let parent = top.id;

            if let Some(start) = stack.iter().position(|f| graph.nodes[f.id].identity.name == spec.name) {
                let mut path: Vec<&str> = stack[start..]
                    .iter()
                    .map(|f| graph.nodes[f.id].identity.name.as_str())
                    .collect();
                path.push(spec.name.as_str());
                return Err(ConfigurationError::new(format!("Dependency cycle: {}", path.join(" -> ")))
                    .with_key(crate::definition::DEPENDENCIES_KEY)
                    .into());
            }

            let child = Self::configure_dependency(ctx, source, &spec, cutoff, dependency_version)?;
            if let Some(&existing) = by_dir.get(&child.output_dir) {
                let shared = &graph.nodes[existing];
                if shared.definition_hash != child.definition_hash {
                    return Err(ConfigurationError::new(format!(
                        "Dependency '{}' of {} resolves to {}, which another node writes with a different definition",
                        spec.name,
                        graph.nodes[parent].slug(),
                        child.output_dir.display()
                    ))
                    .into());
                }
                graph.children[parent].push((spec.name, existing));
                continue;
            }

            let id = graph.nodes.len();
            let dependencies = child.definition.dependencies()?;
            by_dir.insert(child.output_dir.clone(), id);
            graph.push(child);
            graph.children[parent].push((spec.name, id));
            stack.push(Frame {
                id,
                dependencies,
                next: 0,
            });
        }

        graph.fold_lineage();
        tracing::debug!(
            root = %graph.root().slug(),
            nodes = graph.nodes.len(),
            "Built dependency graph"
        );
        Ok(graph)
    }

    fn configure_dependency(
        ctx: &PipelineContext,
        source: &dyn DefinitionSource,
        spec: &DependencySpec,
        cutoff: Option<NaiveDate>,
        explicit: Option<&ParameterVersion>,
    ) -> ExpflowResult<GraphNode> {
        let base = source.load(&spec.name)?;
        if let Some(pinned) = &spec.pinned_version {
            if base.version() != pinned {
                return Err(ConfigurationError::new(format!(
                    "Dependency {}@{pinned} is pinned but the artifact provides version {}",
                    spec.name,
                    base.version()
                ))
                .into());
            }
        }
        let definition = match &spec.definition_override {
            Some(definition_override) => base.with_override(definition_override)?,
            None => base,
        };
        Ok(GraphNode::configure(ctx, definition, cutoff, explicit, false)?)
    }

    // execution order visits children first, so their lineage is final
    fn fold_lineage(&mut self) {
        for index in 0..self.order.len() {
            let id = self.order[index];
            if self.children[id].is_empty() {
                continue;
            }
            let mut hasher = Sha256::new();
            hasher.update(self.nodes[id].definition_hash.as_bytes());
            for (name, child) in &self.children[id] {
                hasher.update(b"\0");
                hasher.update(name.as_bytes());
                hasher.update(b"=");
                hasher.update(self.nodes[*child].lineage_hash.as_bytes());
            }
            self.nodes[id].lineage_hash = hex::encode(&hasher.finalize()[..16]);
        }
    }

    fn push(&mut self, node: GraphNode) {
        self.nodes.push(node);
        self.children.push(Vec::new());
    }

    /// The root node.
    #[must_use]
    pub fn root(&self) -> &GraphNode {
        &self.nodes[0]
    }

    /// Node by id.
    #[must_use]
    pub fn node(&self, id: NodeId) -> &GraphNode {
        &self.nodes[id]
    }

    /// Direct dependencies of `id` as (dependency name, node) pairs.
    #[must_use]
    pub fn children(&self, id: NodeId) -> &[(String, NodeId)] {
        &self.children[id]
    }

    /// Node ids with every dependency before its dependents; the root is last.
    #[must_use]
    pub fn execution_order(&self) -> &[NodeId] {
        &self.order
    }

    /// Number of distinct nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always false; a graph has at least its root.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Every node's owned output directory with the lineage hash of what it writes there.
    pub fn directories(&self) -> impl Iterator<Item = (&Path, &str)> {
        self.nodes
            .iter()
            .map(|n| (n.output_dir.as_path(), n.lineage_hash.as_str()))
    }
}
