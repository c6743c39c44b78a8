//! Episode sources driving concurrent environments.
use crate::{
    dispatcher::{SampleDispatcher, SerialDispatcher, TaskFuture, ThreadPoolDispatcher},
    episode::{run_episode, ChannelClient, SharedPolicy},
    messages::{ActionReply, ActionRequest},
};
use anyhow::Result;
use crossbeam_channel::{unbounded, Receiver};
use std::{cell::RefCell, rc::Rc, time::Duration};
use vracer_core::{
    AgentConfig, CollectedEpisode, Env, EpisodeSource, PolicySnapshot, RolloutPolicy, VracerError,
};

/// Rollout settings shared by the episode sources.
#[derive(Clone, Debug)]
pub struct RolloutConfig {
    /// Number of logical agents collecting experiences.
    pub n_workers: usize,

    /// Length of the state history handed to the policy.
    pub time_sequence_length: usize,

    /// Steps after which an episode is truncated. Zero disables the cap.
    pub episode_step_cap: usize,

    /// Base seed; worker `i` runs its environment with `seed + i`.
    pub seed: u64,
}

impl From<&AgentConfig> for RolloutConfig {
    fn from(config: &AgentConfig) -> Self {
        Self {
            n_workers: config.concurrent_environments,
            time_sequence_length: config.time_sequence_length,
            episode_step_cap: config.episode_step_cap,
            seed: config.seed,
        }
    }
}

/// Single-threaded episode source.
///
/// Episodes run on the calling thread through a [`SerialDispatcher`];
/// workers take turns round-robin. With seeded environments and a seeded
/// policy this source is fully deterministic, which makes it the one used
/// for reproducible runs.
pub struct SerialRollout {
    dispatcher: SerialDispatcher<usize, CollectedEpisode>,
    n_workers: usize,
    next_worker: usize,
}

impl SerialRollout {
    /// Builds the source, constructing one environment per worker.
    pub fn build<E, P>(env_config: &E::Config, policy: P, config: &RolloutConfig) -> Result<Self>
    where
        E: Env + 'static,
        P: RolloutPolicy + 'static,
    {
        let policy = Rc::new(RefCell::new(policy));
        let mut envs = (0..config.n_workers)
            .map(|i| E::build(env_config, config.seed + i as u64))
            .collect::<Result<Vec<_>>>()?;

        let time_sequence_length = config.time_sequence_length;
        let step_cap = config.episode_step_cap;
        let runner_policy = policy.clone();
        let runner = move |worker_id: usize| {
            let mut client = SharedPolicy(runner_policy.clone());
            run_episode(
                &mut envs[worker_id],
                &mut client,
                worker_id,
                time_sequence_length,
                step_cap,
            )
        };
        let on_broadcast = move |snapshot: &PolicySnapshot| policy.borrow_mut().sync(snapshot);

        Ok(Self {
            dispatcher: SerialDispatcher::new(runner, on_broadcast),
            n_workers: config.n_workers,
            next_worker: 0,
        })
    }
}

impl EpisodeSource for SerialRollout {
    fn publish(&mut self, snapshot: &PolicySnapshot) -> Result<()> {
        self.dispatcher.broadcast(snapshot)
    }

    fn collect(&mut self, n_episodes: usize) -> Result<Vec<CollectedEpisode>> {
        let mut episodes = Vec::with_capacity(n_episodes);
        for _ in 0..n_episodes {
            let worker = self.next_worker;
            self.next_worker = (self.next_worker + 1) % self.n_workers;
            episodes.push(self.dispatcher.submit(worker)?.wait()?);
        }
        Ok(episodes)
    }

    fn shutdown(&mut self) -> Result<()> {
        self.dispatcher.shutdown();
        Ok(())
    }
}

/// Multi-threaded episode source.
///
/// Worker threads own their environments and run episodes, sending one
/// action request per step back to the coordinator, which answers every
/// query from the most recently published snapshot. Experiences of a
/// single episode arrive contiguously; episodes interleave by completion
/// order.
pub struct RolloutCoordinator<P: RolloutPolicy> {
    /// Dropped first on shutdown so blocked workers unblock.
    requests: Option<Receiver<ActionRequest>>,
    dispatcher: ThreadPoolDispatcher<(), CollectedEpisode>,
    policy: P,
    pending: Vec<TaskFuture<CollectedEpisode>>,
}

impl<P: RolloutPolicy> RolloutCoordinator<P> {
    /// Builds the coordinator and spawns one worker thread per environment.
    pub fn build<E>(env_config: &E::Config, policy: P, config: &RolloutConfig) -> Self
    where
        E: Env + 'static,
        E::Config: Sync + 'static,
    {
        let (request_tx, request_rx) = unbounded();
        let env_config = env_config.clone();
        let seed = config.seed;
        let time_sequence_length = config.time_sequence_length;
        let step_cap = config.episode_step_cap;

        let dispatcher = ThreadPoolDispatcher::build(config.n_workers, move |worker_id, _| {
            let mut env = E::build(&env_config, seed + worker_id as u64)?;
            let mut client = ChannelClient::new(request_tx.clone());
            Ok(move |_: ()| {
                run_episode(&mut env, &mut client, worker_id, time_sequence_length, step_cap)
            })
        });

        Self {
            requests: Some(request_rx),
            dispatcher,
            policy,
            pending: vec![],
        }
    }

    fn answer(&mut self, request: ActionRequest) -> Result<()> {
        let (action, exp_policy) = self.policy.sample_action(&request.state_seq)?;
        // A worker that gave up on the reply is already unwinding its
        // episode; nothing to do.
        let _ = request.reply.send(ActionReply { action, exp_policy });
        Ok(())
    }
}

impl<P: RolloutPolicy> EpisodeSource for RolloutCoordinator<P> {
    fn publish(&mut self, snapshot: &PolicySnapshot) -> Result<()> {
        self.policy.sync(snapshot);
        self.dispatcher.broadcast(snapshot)
    }

    fn collect(&mut self, n_episodes: usize) -> Result<Vec<CollectedEpisode>> {
        let requests = self
            .requests
            .clone()
            .ok_or_else(|| VracerError::Rollout {
                env_id: 0,
                msg: "coordinator is shut down".into(),
            })?;

        for _ in 0..n_episodes {
            self.pending.push(self.dispatcher.submit(())?);
        }

        let mut episodes = Vec::with_capacity(n_episodes);
        while episodes.len() < n_episodes {
            while let Ok(request) = requests.try_recv() {
                self.answer(request)?;
            }

            let mut i = 0;
            while i < self.pending.len() {
                match self.pending[i].try_take() {
                    Some(result) => {
                        self.pending.swap_remove(i);
                        episodes.push(result?);
                    }
                    None => i += 1,
                }
            }
            if episodes.len() >= n_episodes {
                break;
            }

            // Park on the query channel instead of spinning.
            if let Ok(request) = requests.recv_timeout(Duration::from_millis(1)) {
                self.answer(request)?;
            }
        }
        Ok(episodes)
    }

    fn shutdown(&mut self) -> Result<()> {
        // Closing the query channel fails every in-flight and future action
        // request, so workers unwind their partial episodes and the pool
        // threads can be joined.
        self.requests = None;
        self.pending.clear();
        self.dispatcher.shutdown();
        Ok(())
    }
}
