//! Per-worker episode loop.
use crate::messages::{ActionRequest, ActionReply};
use anyhow::Result;
use crossbeam_channel::{bounded, Sender};
use log::warn;
use std::{cell::RefCell, rc::Rc};
use vracer_core::{
    CollectedEpisode, Env, Experience, PolicyRecord, RolloutPolicy, Termination, VracerError,
};

/// How a worker obtains actions.
///
/// Serial rollouts call the policy in place; threaded workers send an
/// [`ActionRequest`] to the coordinator and block on the reply. These are
/// the only two suspension points of a worker.
pub trait PolicyClient {
    /// Returns an action and the policy record that produced it.
    fn action(&mut self, worker_id: usize, state_seq: &[Vec<f32>])
        -> Result<(Vec<f32>, PolicyRecord)>;
}

/// In-process client sharing the policy with the episode loop.
pub struct SharedPolicy<P: RolloutPolicy>(pub Rc<RefCell<P>>);

impl<P: RolloutPolicy> PolicyClient for SharedPolicy<P> {
    fn action(
        &mut self,
        _worker_id: usize,
        state_seq: &[Vec<f32>],
    ) -> Result<(Vec<f32>, PolicyRecord)> {
        self.0.borrow_mut().sample_action(state_seq)
    }
}

/// Channel-backed client used by pool workers.
#[derive(Clone)]
pub struct ChannelClient {
    requests: Sender<ActionRequest>,
}

impl ChannelClient {
    /// Creates a client sending requests to the given channel.
    pub fn new(requests: Sender<ActionRequest>) -> Self {
        Self { requests }
    }
}

impl PolicyClient for ChannelClient {
    fn action(
        &mut self,
        worker_id: usize,
        state_seq: &[Vec<f32>],
    ) -> Result<(Vec<f32>, PolicyRecord)> {
        let (reply_tx, reply_rx) = bounded(1);
        self.requests
            .send(ActionRequest {
                worker_id,
                state_seq: state_seq.to_vec(),
                reply: reply_tx,
            })
            .map_err(|_| VracerError::Rollout {
                env_id: worker_id,
                msg: "coordinator went away".into(),
            })?;
        let reply: ActionReply = reply_rx.recv().map_err(|_| VracerError::Rollout {
            env_id: worker_id,
            msg: "action request dropped during shutdown".into(),
        })?;
        Ok((reply.action, reply.exp_policy))
    }
}

/// States of the per-worker loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WorkerState {
    Idle,
    AwaitingAction,
    AwaitingObservation,
    Flushed,
}

/// Runs a single episode on the given environment.
///
/// The loop resets the environment, then alternates between requesting an
/// action and applying it until the environment terminates, the step cap
/// expires (the episode is marked truncated and the last observation
/// becomes the saved truncated state), or the environment errors (the
/// episode collected so far is truncated and flushed).
pub fn run_episode<E, C>(
    env: &mut E,
    client: &mut C,
    worker_id: usize,
    time_sequence_length: usize,
    step_cap: usize,
) -> Result<CollectedEpisode>
where
    E: Env,
    C: PolicyClient,
{
    let mut state = WorkerState::Idle;
    let mut obs: Vec<f32> = vec![];
    let mut history: Vec<Vec<f32>> = vec![];
    let mut pending: Option<(Vec<f32>, PolicyRecord)> = None;
    let mut experiences: Vec<Experience> = vec![];

    loop {
        match state {
            WorkerState::Idle => {
                obs = env.reset()?;
                history = vec![obs.clone()];
                state = WorkerState::AwaitingAction;
            }
            WorkerState::AwaitingAction => {
                pending = Some(client.action(worker_id, &history)?);
                state = WorkerState::AwaitingObservation;
            }
            WorkerState::AwaitingObservation => {
                let (action, exp_policy) = pending.take().unwrap();
                match env.step(&action) {
                    Ok(step) => {
                        let terminal = step.is_terminal;
                        let capped = step_cap > 0 && experiences.len() + 1 >= step_cap;
                        let termination = if terminal {
                            Termination::Terminal
                        } else if capped {
                            Termination::Truncated
                        } else {
                            Termination::NonTerminal
                        };
                        experiences.push(Experience {
                            state: obs.clone(),
                            action,
                            reward: step.reward,
                            episode_id: 0,
                            episode_pos: experiences.len(),
                            environment_id: worker_id,
                            termination,
                            truncated_state: (termination == Termination::Truncated)
                                .then(|| step.obs.clone()),
                            exp_policy,
                        });
                        if termination == Termination::NonTerminal {
                            obs = step.obs;
                            history.push(obs.clone());
                            if history.len() > time_sequence_length {
                                history.remove(0);
                            }
                            state = WorkerState::AwaitingAction;
                        } else {
                            state = WorkerState::Flushed;
                        }
                    }
                    Err(e) => {
                        // The environment failed mid-episode: truncate what
                        // was collected and flush it.
                        warn!("environment {} failed: {}", worker_id, e);
                        match experiences.last_mut() {
                            Some(last) => {
                                last.termination = Termination::Truncated;
                                last.truncated_state = Some(obs.clone());
                                state = WorkerState::Flushed;
                            }
                            None => {
                                return Err(VracerError::Rollout {
                                    env_id: worker_id,
                                    msg: e.to_string(),
                                }
                                .into())
                            }
                        }
                    }
                }
            }
            WorkerState::Flushed => {
                return Ok(CollectedEpisode {
                    environment_id: worker_id,
                    experiences,
                });
            }
        }
    }
}
