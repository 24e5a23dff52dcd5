use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use neuroflow_core::config::EngineConfig;
use neuroflow_core::error::{FlowError, Result};
use neuroflow_core::traits::{Publication, Sink, Unit};
use neuroflow_core::types::{
    describe_tags, render_value, IterationTag, PortRef, PortValues, UnitContext, Value,
};

use crate::graph::{
    Composite, ExpandedGraph, Graph, Node, NodeKind, SINK_CONTAINER, SINK_SUBSTITUTIONS,
};
use crate::report::{ExecutionReport, NodeReport, NodeStatus, PublishRecord};

/// Scheduling limits for an [`Executor`].
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Root of every node work directory.
    pub work_dir: PathBuf,
    /// Maximum number of unit invocations running at once.
    pub max_parallel: usize,
    /// Default bound on a single unit invocation.
    pub node_timeout: Option<Duration>,
}

impl ExecutorConfig {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            max_parallel: 4,
            node_timeout: None,
        }
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }
}

impl From<&EngineConfig> for ExecutorConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            work_dir: config.work_dir.clone(),
            max_parallel: config.max_parallel.max(1),
            node_timeout: config.node_timeout_secs.map(Duration::from_secs),
        }
    }
}

/// What one graph level produced.
#[derive(Default)]
struct GraphRun {
    reports: Vec<NodeReport>,
    publications: Vec<PublishRecord>,
    outputs: HashMap<String, PortValues>,
}

/// What one node produced.
#[derive(Default)]
struct NodeRun {
    outputs: PortValues,
    children: Vec<NodeReport>,
    publications: Vec<PublishRecord>,
    /// Internal node whose best-effort failure left exposed outputs unset.
    starved_by: Option<String>,
}

/// Runs expanded graphs.
///
/// Nodes become eligible once every upstream producer has finished; the
/// eligible frontier runs concurrently on tokio tasks. Only unit
/// invocations hold a concurrency permit, so composites waiting on their
/// internal graph never starve it. Publications to the sink are serialized.
#[derive(Clone)]
pub struct Executor {
    config: Arc<ExecutorConfig>,
    sink: Arc<dyn Sink>,
    permits: Arc<Semaphore>,
    publish_lock: Arc<Mutex<()>>,
}

impl Executor {
    pub fn new(config: ExecutorConfig, sink: Arc<dyn Sink>) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_parallel.max(1)));
        Self {
            config: Arc::new(config),
            sink,
            permits,
            publish_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Execute `expanded` to completion.
    ///
    /// Returns the report when every node either succeeded or failed under
    /// the best-effort policy. Any other failure aborts the run: nothing new
    /// is launched, in-flight nodes are drained and the first failure is
    /// returned.
    pub async fn run(&self, expanded: &ExpandedGraph) -> Result<ExecutionReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(
            run_id = %run_id,
            workflow = %expanded.name(),
            nodes = expanded.len(),
            max_parallel = self.config.max_parallel,
            "Starting workflow run"
        );

        let base_dir = self.config.work_dir.join(expanded.name());
        let graph = Arc::new(expanded.graph.clone());
        let run = self.run_graph(graph, base_dir, vec![]).await?;

        let succeeded = run
            .reports
            .iter()
            .all(|r| r.status == NodeStatus::Succeeded);
        let report = ExecutionReport {
            run_id,
            workflow: expanded.name().to_string(),
            started_at,
            finished_at: Utc::now(),
            nodes: run.reports,
            publications: run.publications,
            succeeded,
        };
        info!(
            run_id = %run_id,
            succeeded,
            published = report.publications.len(),
            elapsed_ms = report.elapsed_ms(),
            "Workflow run finished"
        );
        Ok(report)
    }

    fn run_graph(
        &self,
        graph: Arc<Graph>,
        base_dir: PathBuf,
        scope: Vec<IterationTag>,
    ) -> BoxFuture<'static, Result<GraphRun>> {
        let exec = self.clone();
        Box::pin(async move { exec.schedule(graph, base_dir, scope).await })
    }

    async fn schedule(
        &self,
        graph: Arc<Graph>,
        base_dir: PathBuf,
        scope: Vec<IterationTag>,
    ) -> Result<GraphRun> {
        let mut indegree: HashMap<String, usize> = graph
            .nodes()
            .iter()
            .map(|n| (n.id.clone(), graph.upstream(&n.id).len()))
            .collect();
        let mut ready: VecDeque<String> = graph
            .nodes()
            .iter()
            .filter(|n| indegree.get(&n.id) == Some(&0))
            .map(|n| n.id.clone())
            .collect();

        let mut run = GraphRun::default();
        let mut finished: HashSet<String> = HashSet::new();
        let mut broken: HashSet<String> = HashSet::new();
        let mut first_error: Option<FlowError> = None;
        let mut tasks: JoinSet<(String, u64, Result<NodeRun>)> = JoinSet::new();

        loop {
            while first_error.is_none() {
                let Some(id) = ready.pop_front() else { break };
                let Some(node) = graph.node(&id).cloned() else {
                    continue;
                };

                let starved_by = graph
                    .upstream(&id)
                    .into_iter()
                    .find(|u| broken.contains(*u))
                    .map(str::to_string);
                if let Some(upstream) = starved_by {
                    warn!(node_id = %id, upstream = %upstream, "Node starved by upstream failure");
                    run.reports.push(NodeReport {
                        node_id: id.clone(),
                        status: NodeStatus::Starved,
                        elapsed_ms: 0,
                        iteration: iteration_of(&scope, &node),
                        error: Some(format!("upstream node '{}' failed", upstream)),
                    });
                    broken.insert(id.clone());
                    finished.insert(id.clone());
                    release(&graph, &id, &mut indegree, &mut ready);
                    continue;
                }

                let inputs = resolve_inputs(&graph, &node, &run.outputs);
                let work_dir = base_dir.join(&node.id);
                let exec = self.clone();
                let scope = scope.clone();
                debug!(node_id = %id, kind = %node.kind.label(), "Launching node");
                tasks.spawn(async move {
                    let started = Instant::now();
                    let result = AssertUnwindSafe(exec.execute_node(&node, inputs, work_dir, scope))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|panic| {
                            Err(FlowError::unit(node.kind.label(), panic_message(panic)))
                        });
                    (node.id, started.elapsed().as_millis() as u64, result)
                });
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            let (id, elapsed_ms, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!(error = %e, "Node task aborted");
                    if first_error.is_none() {
                        first_error = Some(FlowError::unit("executor", e));
                    }
                    continue;
                }
            };
            let Some(node) = graph.node(&id) else {
                continue;
            };
            let iteration = iteration_of(&scope, node);
            finished.insert(id.clone());

            let result = match result {
                Ok(mut done)
                    if done.starved_by.is_some()
                        && missing_output(&graph, node, &done).is_some() =>
                {
                    let inner = done.starved_by.take().unwrap_or_default();
                    warn!(node_id = %id, inner = %inner, "Composite starved by internal failure");
                    for mut child in done.children.drain(..) {
                        child.node_id = format!("{}/{}", id, child.node_id);
                        run.reports.push(child);
                    }
                    run.reports.push(NodeReport {
                        node_id: id.clone(),
                        status: NodeStatus::Starved,
                        elapsed_ms,
                        iteration,
                        error: Some(format!("internal node '{}' failed", inner)),
                    });
                    run.publications.append(&mut done.publications);
                    broken.insert(id.clone());
                    release(&graph, &id, &mut indegree, &mut ready);
                    continue;
                }
                other => other,
            };

            let result = result
                .map_err(|source| FlowError::NodeFailed {
                    node: id.clone(),
                    port: None,
                    iteration: iteration.clone(),
                    source: Box::new(source),
                })
                .and_then(|done| check_outputs(&graph, node, iteration.clone(), done));

            match result {
                Ok(mut done) => {
                    info!(node_id = %id, elapsed_ms, "Node succeeded");
                    for mut child in done.children.drain(..) {
                        child.node_id = format!("{}/{}", id, child.node_id);
                        run.reports.push(child);
                    }
                    run.reports.push(NodeReport {
                        node_id: id.clone(),
                        status: NodeStatus::Succeeded,
                        elapsed_ms,
                        iteration,
                        error: None,
                    });
                    run.publications.append(&mut done.publications);
                    run.outputs.insert(id.clone(), done.outputs);
                    release(&graph, &id, &mut indegree, &mut ready);
                }
                Err(err) if node.options.best_effort => {
                    warn!(node_id = %id, elapsed_ms, error = %err, "Best-effort node failed");
                    run.reports.push(NodeReport {
                        node_id: id.clone(),
                        status: NodeStatus::Failed,
                        elapsed_ms,
                        iteration,
                        error: Some(err.to_string()),
                    });
                    broken.insert(id.clone());
                    release(&graph, &id, &mut indegree, &mut ready);
                }
                Err(err) => {
                    error!(node_id = %id, elapsed_ms, error = %err, "Node failed, aborting run");
                    run.reports.push(NodeReport {
                        node_id: id.clone(),
                        status: NodeStatus::Failed,
                        elapsed_ms,
                        iteration,
                        error: Some(err.to_string()),
                    });
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }
        if finished.len() < graph.len() {
            let pending: Vec<String> = graph
                .nodes()
                .iter()
                .filter(|n| !finished.contains(&n.id))
                .map(|n| n.id.clone())
                .collect();
            error!(pending = pending.len(), "Scheduler deadlocked");
            return Err(FlowError::Deadlock { pending });
        }
        Ok(run)
    }

    async fn execute_node(
        &self,
        node: &Node,
        inputs: PortValues,
        work_dir: PathBuf,
        scope: Vec<IterationTag>,
    ) -> Result<NodeRun> {
        let mut tags = scope;
        tags.extend(node.tags.iter().cloned());
        let ctx = UnitContext {
            node_id: node.id.clone(),
            tags,
            work_dir,
            map_index: None,
        };

        match &node.kind {
            NodeKind::Atomic(unit) => {
                let outputs = self.run_atomic(node, unit, ctx, inputs).await?;
                Ok(NodeRun {
                    outputs,
                    ..NodeRun::default()
                })
            }
            NodeKind::Composite(composite) => self.run_composite(composite, ctx, inputs).await,
            NodeKind::Sink => self.run_sink(node, &ctx, inputs).await,
        }
    }

    async fn run_atomic(
        &self,
        node: &Node,
        unit: &Arc<dyn Unit>,
        ctx: UnitContext,
        inputs: PortValues,
    ) -> Result<PortValues> {
        let timeout = node
            .options
            .timeout_secs
            .map(Duration::from_secs)
            .or(self.config.node_timeout);

        if node.options.map_over.is_empty() {
            return self.invoke(node, unit, ctx, inputs, timeout).await;
        }

        let count = map_length(node, &inputs)?;
        debug!(node_id = %node.id, elements = count, "Mapping node over inputs");
        let invocations = (0..count).map(|i| {
            let mut element = inputs.clone();
            for port in &node.options.map_over {
                if let Some(Value::Array(items)) = inputs.get(port) {
                    element.insert(port.clone(), items[i].clone());
                }
            }
            let mut element_ctx = ctx.clone();
            element_ctx.work_dir = ctx.work_dir.join(format!("_{}{}", node.base, i));
            element_ctx.map_index = Some(i);
            self.invoke(node, unit, element_ctx, element, timeout)
        });
        let results = join_all(invocations).await;

        let mut collected: HashMap<&str, Vec<Value>> = HashMap::new();
        for result in results {
            let values = result?;
            for port in &node.ports.outputs {
                if let Some(v) = values.get(port) {
                    collected.entry(port.as_str()).or_default().push(v.clone());
                }
            }
        }
        Ok(node
            .ports
            .outputs
            .iter()
            .filter_map(|port| {
                let values = collected.remove(port.as_str()).unwrap_or_default();
                (values.len() == count).then(|| (port.clone(), Value::Array(values)))
            })
            .collect())
    }

    async fn invoke(
        &self,
        node: &Node,
        unit: &Arc<dyn Unit>,
        ctx: UnitContext,
        inputs: PortValues,
        timeout: Option<Duration>,
    ) -> Result<PortValues> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| FlowError::unit(unit.name(), e))?;
        tokio::fs::create_dir_all(&ctx.work_dir).await?;

        match timeout {
            Some(limit) => tokio::time::timeout(limit, unit.run(ctx, inputs))
                .await
                .map_err(|_| FlowError::NodeTimeout {
                    node: node.id.clone(),
                    timeout_ms: limit.as_millis() as u64,
                })?,
            None => unit.run(ctx, inputs).await,
        }
    }

    async fn run_composite(
        &self,
        composite: &Composite,
        ctx: UnitContext,
        inputs: PortValues,
    ) -> Result<NodeRun> {
        let mut inner = composite.graph().clone();
        for (name, value) in &inputs {
            for target in composite.input_targets(name) {
                inner.set_input(target, value.clone())?;
            }
        }
        let expanded = inner.expand()?;
        debug!(
            node_id = %ctx.node_id,
            internal_nodes = expanded.len(),
            "Running composite"
        );

        let graph = Arc::new(expanded.graph);
        let run = self.run_graph(graph, ctx.work_dir, ctx.tags).await?;

        let mut outputs = PortValues::new();
        for (name, source) in composite.exposed_outputs() {
            if let Some(value) = run
                .outputs
                .get(&source.node)
                .and_then(|o| o.get(&source.port))
            {
                outputs.insert(name.clone(), value.clone());
            }
        }
        let incomplete = composite
            .exposed_outputs()
            .any(|(name, _)| !outputs.contains_key(name));
        let starved_by = if incomplete {
            run.reports
                .iter()
                .find(|r| r.status == NodeStatus::Failed)
                .map(|r| r.node_id.clone())
        } else {
            None
        };
        Ok(NodeRun {
            outputs,
            children: run.reports,
            publications: run.publications,
            starved_by,
        })
    }

    async fn run_sink(&self, node: &Node, ctx: &UnitContext, inputs: PortValues) -> Result<NodeRun> {
        let container = inputs
            .get(SINK_CONTAINER)
            .filter(|v| !v.is_null())
            .map(render_value)
            .unwrap_or_default();
        let substitutions: Vec<(String, String)> = match inputs.get(SINK_SUBSTITUTIONS) {
            Some(Value::Null) | None => vec![],
            Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                FlowError::Sink(format!("substitutions must be (pattern, replacement) pairs: {}", e))
            })?,
        };
        let tag_dirs: Vec<String> = node.tags.iter().map(IterationTag::dir_name).collect();

        let mut publications = vec![];
        for port in &node.ports.inputs {
            let dest = port.name.as_str();
            if dest == SINK_CONTAINER || dest == SINK_SUBSTITUTIONS {
                continue;
            }
            let Some(value) = inputs.get(dest).filter(|v| !v.is_null()) else {
                continue;
            };
            let folder = destination_folder(dest);

            let mut files = vec![];
            let items: Vec<(String, Value)> = if string_leaves(value, &mut files) {
                files
                    .into_iter()
                    .map(|file| {
                        let fragment = file_fragment(&file, &self.config.work_dir);
                        (join_path(&folder, &fragment), Value::String(file))
                    })
                    .collect()
            } else {
                let mut parts = tag_dirs.clone();
                parts.push(format!("{}.json", destination_leaf(dest)));
                vec![(join_path(&folder, &parts.join("/")), value.clone())]
            };

            for (relative, value) in items {
                let path = {
                    let _guard = self.publish_lock.lock().await;
                    self.sink
                        .publish(Publication {
                            container: &container,
                            relative_path: &relative,
                            substitutions: &substitutions,
                            value: &value,
                        })
                        .await?
                };
                debug!(node_id = %ctx.node_id, container = %container, path = %path, "Published");
                publications.push(PublishRecord {
                    node_id: ctx.node_id.clone(),
                    container: container.clone(),
                    path,
                    value,
                });
            }
        }

        Ok(NodeRun {
            publications,
            ..NodeRun::default()
        })
    }
}

/// Decrement the in-degree of every consumer of `id`, queueing those that
/// become eligible.
fn release(
    graph: &Graph,
    id: &str,
    indegree: &mut HashMap<String, usize>,
    ready: &mut VecDeque<String>,
) {
    for next in graph.nodes_after(id) {
        if let Some(d) = indegree.get_mut(next) {
            *d = d.saturating_sub(1);
            if *d == 0 {
                ready.push_back(next.to_string());
            }
        }
    }
}

/// Static values, overridden by connected values. Fan-in inputs receive
/// their sources as a list in connection order.
fn resolve_inputs(graph: &Graph, node: &Node, outputs: &HashMap<String, PortValues>) -> PortValues {
    let mut values = node.statics.clone();
    for port in &node.ports.inputs {
        let incoming = graph.incoming(&PortRef::new(node.id.clone(), port.name.clone()));
        if incoming.is_empty() {
            continue;
        }
        let mut resolved = incoming.iter().filter_map(|c| {
            outputs
                .get(&c.from.node)
                .and_then(|o| o.get(&c.from.port))
                .cloned()
        });
        if port.fan_in {
            values.insert(port.name.clone(), Value::Array(resolved.collect()));
        } else if let Some(value) = resolved.next() {
            values.insert(port.name.clone(), value);
        }
    }
    values
}

/// Every output some consumer is connected to must have been produced.
fn check_outputs(
    graph: &Graph,
    node: &Node,
    iteration: Option<String>,
    done: NodeRun,
) -> Result<NodeRun> {
    match missing_output(graph, node, &done) {
        Some(port) => Err(FlowError::NodeFailed {
            node: node.id.clone(),
            port: Some(port),
            iteration,
            source: Box::new(FlowError::unit(
                node.kind.label(),
                "connected output was not produced",
            )),
        }),
        None => Ok(done),
    }
}

/// First connected output port of `node` that `done` did not produce.
fn missing_output(graph: &Graph, node: &Node, done: &NodeRun) -> Option<String> {
    graph
        .connections()
        .iter()
        .find(|c| c.from.node == node.id && !done.outputs.contains_key(&c.from.port))
        .map(|c| c.from.port.clone())
}

fn map_length(node: &Node, inputs: &PortValues) -> Result<usize> {
    let mut count: Option<usize> = None;
    for port in &node.options.map_over {
        let len = match inputs.get(port) {
            Some(Value::Array(items)) => items.len(),
            Some(_) => {
                return Err(FlowError::ShapeMismatch(format!(
                    "mapped input '{}' of node '{}' is not a list",
                    port, node.id
                )))
            }
            None => {
                return Err(FlowError::MissingInput {
                    unit: node.kind.label().to_string(),
                    port: port.clone(),
                })
            }
        };
        match count {
            Some(expected) if expected != len => {
                return Err(FlowError::ShapeMismatch(format!(
                    "mapped inputs of node '{}' have lengths {} and {}",
                    node.id, expected, len
                )))
            }
            _ => count = Some(len),
        }
    }
    Ok(count.unwrap_or(0))
}

fn iteration_of(scope: &[IterationTag], node: &Node) -> Option<String> {
    let tags: Vec<IterationTag> = scope.iter().chain(node.tags.iter()).cloned().collect();
    describe_tags(&tags)
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

/// `qa.model.@matrix` publishes into `qa/model`.
fn destination_folder(dest: &str) -> String {
    dest.split('.')
        .filter(|part| !part.is_empty() && !part.starts_with('@'))
        .collect::<Vec<_>>()
        .join("/")
}

fn destination_leaf(dest: &str) -> &str {
    dest.rsplit('.')
        .next()
        .map(|leaf| leaf.trim_start_matches('@'))
        .unwrap_or(dest)
}

/// Collect string leaves of `value`; false when any leaf is not a string.
fn string_leaves(value: &Value, out: &mut Vec<String>) -> bool {
    match value {
        Value::String(s) => {
            out.push(s.clone());
            true
        }
        Value::Array(items) => items.iter().all(|item| string_leaves(item, out)),
        _ => false,
    }
}

/// Iteration and map directories of a produced file plus its name.
///
/// `work/first_level/_subject_id_01/fixedfx/flameo/_flameo0/stats/cope1.nii.gz`
/// becomes `_subject_id_01/_flameo0/cope1.nii.gz`.
fn file_fragment(file: &str, work_root: &Path) -> String {
    let path = Path::new(file);
    let relative = path.strip_prefix(work_root).unwrap_or(path);
    let parts: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    match parts.split_last() {
        Some((name, dirs)) => dirs
            .iter()
            .filter(|d| d.starts_with('_'))
            .chain(std::iter::once(name))
            .cloned()
            .collect::<Vec<_>>()
            .join("/"),
        None => String::new(),
    }
}

fn join_path(folder: &str, fragment: &str) -> String {
    if folder.is_empty() {
        fragment.to_string()
    } else {
        format!("{}/{}", folder, fragment)
    }
}
