//! Full-stack training runs: trainer, learner and rollout sources together.
use anyhow::Result;
use vracer_agent::{ContinuousPolicy, MlpEngine, PolicyModel, SnapshotPolicy, Vracer};
use vracer_core::{
    AgentConfig, Env, EnvStep, Learner, TerminationReason, Trainer, VariableConfig,
};
use vracer_rollout::{RolloutConfig, RolloutCoordinator, SerialRollout};

/// One-dimensional point chasing the target 0.5.
struct PointEnv {
    s: f32,
}

impl Env for PointEnv {
    type Config = ();

    fn build(_config: &(), _seed: u64) -> Result<Self> {
        Ok(Self { s: 0.0 })
    }

    fn reset(&mut self) -> Result<Vec<f32>> {
        self.s = 0.0;
        Ok(vec![self.s])
    }

    fn step(&mut self, action: &[f32]) -> Result<EnvStep> {
        self.s += 0.1 * action[0];
        Ok(EnvStep {
            obs: vec![self.s],
            reward: -(self.s - 0.5) * (self.s - 0.5),
            is_terminal: false,
        })
    }
}

fn config() -> AgentConfig {
    AgentConfig::default()
        .mini_batch_size(16)
        .experience_replay_start_size(64)
        .experience_replay_maximum_size(256)
        .discount_factor(0.99)
        .episodes_per_generation(4)
        .episode_step_cap(16)
        .experiences_between_policy_updates(4.0)
        .neural_network_hidden_layers(vec![8])
        .seed(17)
        .variables(vec![
            VariableConfig::state("position"),
            VariableConfig::action("force", -1.0, 1.0).initial_exploration_noise(0.5),
        ])
}

fn learner(config: &AgentConfig) -> Vracer<ContinuousPolicy, MlpEngine> {
    let model = ContinuousPolicy::new(
        config.action_lower_bounds(),
        config.action_upper_bounds(),
        config.exploration_noise(),
    );
    let engine = MlpEngine::build(
        config.state_dim() * config.time_sequence_length,
        &config.neural_network_hidden_layers,
        model.output_dim(),
        &config.neural_network_optimizer,
        config.seed,
    )
    .unwrap();
    Vracer::build(config.clone(), model, engine).unwrap()
}

fn rollout_policy(config: &AgentConfig) -> SnapshotPolicy<ContinuousPolicy, MlpEngine> {
    let model = ContinuousPolicy::new(
        config.action_lower_bounds(),
        config.action_upper_bounds(),
        config.exploration_noise(),
    );
    let engine = MlpEngine::build(
        config.state_dim() * config.time_sequence_length,
        &config.neural_network_hidden_layers,
        model.output_dim(),
        &config.neural_network_optimizer,
        config.seed,
    )
    .unwrap();
    SnapshotPolicy::new(model, engine, config.time_sequence_length, config.seed)
}

#[test]
fn serial_smoke_run_fills_the_replay_and_updates_the_policy() {
    // 10 generations of 4 truncated episodes of 16 steps each.
    let config = config().max_episodes(40);
    let mut learner = learner(&config);
    let mut source =
        SerialRollout::build::<PointEnv, _>(&(), rollout_policy(&config), &RolloutConfig::from(&config))
            .unwrap();
    let mut trainer = Trainer::build(&config, None);

    let reason = trainer.train(&mut learner, &mut source).unwrap();
    assert_eq!(reason, TerminationReason::MaxEpisodes);
    assert_eq!(trainer.generation(), 10);

    // 640 experiences seen: the ring is full and wrapped across episodes.
    assert_eq!(learner.replay().len(), 256);
    assert!(learner.policy_update_count() > 100);

    // The replay stayed predominantly on-policy.
    let ratio = learner.replay().off_policy_ratio();
    assert!(ratio <= 0.2, "off-policy ratio {ratio}");
    assert!(learner.average_training_reward().is_finite());
    assert!(learner.best_params().is_some());
}

#[test]
fn serial_runs_with_identical_seeds_are_reproducible() {
    let config = config().max_episodes(12);

    let mut params = vec![];
    for _ in 0..2 {
        let mut learner = learner(&config);
        let mut source = SerialRollout::build::<PointEnv, _>(
            &(),
            rollout_policy(&config),
            &RolloutConfig::from(&config),
        )
        .unwrap();
        let mut trainer = Trainer::build(&config, None);
        trainer.train(&mut learner, &mut source).unwrap();
        params.push(learner.policy_snapshot(0, false).params);
    }
    assert_eq!(params[0], params[1]);
}

#[test]
fn evaluation_reports_deterministic_returns() {
    let config = config().max_episodes(8);
    let mut learner = learner(&config);
    let mut source =
        SerialRollout::build::<PointEnv, _>(&(), rollout_policy(&config), &RolloutConfig::from(&config))
            .unwrap();
    let mut trainer = Trainer::build(&config, None);
    trainer.train(&mut learner, &mut source).unwrap();

    let first = trainer.evaluate(&mut learner, &mut source, 2).unwrap();
    let second = trainer.evaluate(&mut learner, &mut source, 2).unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(first, second);
    assert!(first.iter().all(|r| r.is_finite()));
}

#[test]
fn threaded_coordinator_trains_end_to_end() {
    let config = config()
        .concurrent_environments(2)
        .max_episodes(8);
    let mut learner = learner(&config);
    let mut source = RolloutCoordinator::build::<PointEnv>(
        &(),
        rollout_policy(&config),
        &RolloutConfig::from(&config),
    );
    let mut trainer = Trainer::build(&config, None);

    let reason = trainer.train(&mut learner, &mut source).unwrap();
    assert_eq!(reason, TerminationReason::MaxEpisodes);
    assert_eq!(learner.episode_count(), 8);
    assert_eq!(learner.experience_count(), 8 * 16);
}

#[test]
fn per_generation_checkpoints_are_written() {
    let dir = tempfile::tempdir().unwrap();
    let config = config()
        .max_episodes(4)
        .experience_replay_serialize(true);
    let mut learner = learner(&config);
    let mut source =
        SerialRollout::build::<PointEnv, _>(&(), rollout_policy(&config), &RolloutConfig::from(&config))
            .unwrap();
    let mut trainer = Trainer::build(&config, Some(dir.path().to_path_buf()));
    trainer.train(&mut learner, &mut source).unwrap();

    assert!(dir.path().join("checkpoint.json").exists());
}
