//! Graph runtime (C9): drives a session through planner → decider →
//! executor/reporter until it reaches a terminal state.
//!
//! Grounded on `LangGraphOrchestrator` in `ai/graph/core_graph.py`: the edge
//! table and node-wrapper dispatch loop are the same shape, generalized from
//! a compiled external graph library to a plain loop over our own node
//! structs, each persisting through [`CheckpointStore`] between ticks.

use crate::checkpoint::CheckpointStore;
use crate::config::GraphConfig;
use crate::error::{OrchestratorError, Result};
use crate::model::{NextNode, Session, SessionStatus, UserContext};
use crate::nodes::{Decider, Decision, Executor, Planner, Reporter, SessionReport};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Hard ceiling on node dispatches per `run_loop` call, independent of the
/// session's own `max_steps`/`retry_budget` limits. Those bound legitimate
/// work; this only guards against a runtime bug looping without ever
/// tripping either of them.
const MAX_DISPATCHES_PER_TICK: u32 = 10_000;

/// Outcome of driving a session to its next pause point: either it is still
/// running (waiting on a resource) or it has produced a final report.
#[derive(Debug, Clone)]
pub enum RunResult {
    InProgress { session_id: String, next_node: NextNode },
    Finished { session_id: String, report: SessionReport },
}

struct SessionHandle {
    lock: Arc<Mutex<()>>,
    cancelled: Arc<std::sync::atomic::AtomicBool>,
}

pub struct GraphRuntime {
    checkpoints: CheckpointStore,
    planner: Planner,
    decider: Decider,
    executor: Executor,
    reporter: Reporter,
    sessions: DashMap<String, SessionHandle>,
}

impl GraphRuntime {
    pub fn new(checkpoints: CheckpointStore, executor: Executor, graph_config: GraphConfig) -> Self {
        Self {
            checkpoints,
            planner: Planner::new(),
            decider: Decider::new(graph_config),
            executor,
            reporter: Reporter::new(),
            sessions: DashMap::new(),
        }
    }

    pub async fn start(&self, session_id: impl Into<String>, goal: impl Into<String>, user: UserContext) -> Result<RunResult> {
        let session_id = session_id.into();
        let mut session = Session::new(session_id.clone(), goal, user);
        self.register(&session_id);
        self.run_loop(&mut session).await
    }

    pub async fn resume(&self, session_id: &str) -> Result<RunResult> {
        let mut session = self
            .checkpoints
            .read(session_id)
            .await?
            .ok_or_else(|| OrchestratorError::SessionNotFound(session_id.to_string()))?;
        self.register(session_id);
        self.run_loop(&mut session).await
    }

    pub fn cancel(&self, session_id: &str) -> bool {
        match self.sessions.get(session_id) {
            Some(handle) => {
                handle.cancelled.store(true, std::sync::atomic::Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    pub async fn state(&self, session_id: &str) -> Result<Option<Session>> {
        self.checkpoints.read(session_id).await
    }

    fn register(&self, session_id: &str) {
        self.sessions.entry(session_id.to_string()).or_insert_with(|| SessionHandle {
            lock: Arc::new(Mutex::new(())),
            cancelled: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        });
    }

    fn is_cancelled(&self, session_id: &str) -> bool {
        self.sessions
            .get(session_id)
            .map(|h| h.cancelled.load(std::sync::atomic::Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Serialize ticks for a single session id; two callers racing `resume`
    /// or `start`/`resume` on the same id block on each other here.
    async fn run_loop(&self, session: &mut Session) -> Result<RunResult> {
        let handle_lock = self
            .sessions
            .get(&session.session_id)
            .map(|h| h.lock.clone())
            .expect("register() always runs before run_loop()");
        let _guard = handle_lock.lock().await;

        for _ in 0..MAX_DISPATCHES_PER_TICK {
            match session.next_node {
                NextNode::Planner => {
                    let (plan, error) = self.planner.plan(&session.goal, session.user.role);
                    session.plan = plan;
                    if let Some(error) = error {
                        session.add_error(error);
                    }
                    session.status = SessionStatus::Executing;
                    session.next_node = NextNode::Decider;
                }
                NextNode::Decider => {
                    if self.is_cancelled(&session.session_id) {
                        session.status = SessionStatus::Cancelled;
                        session.next_node = NextNode::Reporter;
                    } else {
                        match self.decider.decide(session) {
                            Decision::Execute(item_id) => {
                                session.current_step_item = Some(item_id);
                                session.next_node = NextNode::Executor;
                            }
                            Decision::Wait(_reason) => {
                                self.checkpoints.write(session).await?;
                                return Ok(RunResult::InProgress {
                                    session_id: session.session_id.clone(),
                                    next_node: NextNode::Decider,
                                });
                            }
                            Decision::StopReport(_reason) => {
                                session.next_node = NextNode::Reporter;
                            }
                        }
                    }
                }
                NextNode::Executor => {
                    let item_id = session
                        .current_step_item
                        .clone()
                        .ok_or_else(|| OrchestratorError::Critical("executor entered with no selected item".to_string()))?;
                    self.executor.execute(session, &item_id).await?;
                    session.next_node = NextNode::Decider;
                }
                NextNode::Reporter => {
                    let report = self.reporter.report(session);
                    self.checkpoints.write(session).await?;
                    return Ok(RunResult::Finished { session_id: session.session_id.clone(), report });
                }
                NextNode::Terminal => {
                    let report = self.reporter.report(session);
                    return Ok(RunResult::Finished { session_id: session.session_id.clone(), report });
                }
            }

            self.checkpoints.write(session).await?;
        }

        session.status = SessionStatus::Failed;
        self.checkpoints.write(session).await?;
        Err(OrchestratorError::Critical(format!(
            "session '{}' exceeded {MAX_DISPATCHES_PER_TICK} node dispatches without reaching a pause point",
            session.session_id
        )))
    }
}
