//! End-to-end scenarios for the learner, driven by scripted episodes.
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha12Rng;
use rand_distr::{Distribution, Normal};
use vracer_agent::{ContinuousPolicy, MlpEngine, PolicyModel, Vracer};
use vracer_core::{
    AgentConfig, CollectedEpisode, Experience, Learner, PolicyRecord, Termination, TensorEngine,
    VariableConfig,
};

const GAMMA: f32 = 0.99;

fn config() -> AgentConfig {
    AgentConfig::default()
        .mini_batch_size(16)
        .experience_replay_start_size(64)
        .experience_replay_maximum_size(256)
        .discount_factor(GAMMA)
        .experience_replay_off_policy_annealing_rate(0.05)
        .neural_network_hidden_layers(vec![8])
        .seed(13)
        .variables(vec![
            VariableConfig::state("position"),
            VariableConfig::action("force", -1.0, 1.0).initial_exploration_noise(0.5),
        ])
}

fn agent(config: &AgentConfig) -> Vracer<ContinuousPolicy, MlpEngine> {
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

/// A scripted experience whose action pretends to come from a unit-mean-zero
/// policy; the pre-tanh sample is stored so importance weights are exact.
fn scripted_experience(rng: &mut ChaCha12Rng, pos: usize, reward: f32) -> Experience {
    let u: f32 = Normal::new(0.0, 0.5).unwrap().sample(rng);
    Experience {
        state: vec![rng.gen_range(-1.0..1.0)],
        action: vec![u.tanh()],
        reward,
        episode_id: 0,
        episode_pos: pos,
        environment_id: 0,
        termination: Termination::NonTerminal,
        truncated_state: None,
        exp_policy: PolicyRecord {
            state_value: 0.0,
            distribution_params: vec![0.0, 0.5],
            unbounded_action: Some(vec![u]),
            ..Default::default()
        },
    }
}

fn scripted_episode(rng: &mut ChaCha12Rng, n_steps: usize) -> CollectedEpisode {
    let mut experiences: Vec<Experience> = (0..n_steps)
        .map(|pos| {
            let u = rng.gen_range(-1.0..1.0);
            scripted_experience(rng, pos, u)
        })
        .collect();
    experiences.last_mut().unwrap().termination = Termination::Terminal;
    CollectedEpisode {
        environment_id: 0,
        experiences,
    }
}

#[test]
fn truncated_episodes_bootstrap_from_the_saved_state() {
    let mut agent = agent(&config());
    let mut rng = ChaCha12Rng::seed_from_u64(1);

    let mut episode = scripted_episode(&mut rng, 5);
    let last = episode.experiences.last_mut().unwrap();
    last.termination = Termination::Truncated;
    last.truncated_state = Some(vec![0.7]);
    let last_reward = last.reward;
    agent.process_episode(episode).unwrap();

    let replay = agent.replay();
    let last_index = replay.newest().unwrap();
    let truncated_value = replay.truncated_state_value(last_index).unwrap();

    // The saved state's value comes from the critic head of an engine with
    // identical parameters.
    let model = ContinuousPolicy::new(vec![-1.0], vec![1.0], vec![0.5]);
    let mut twin = MlpEngine::build(1, &[8], model.output_dim(), "Adam", 13).unwrap();
    let outputs = twin.forward(&[vec![vec![0.7]]]).unwrap();
    let expected_value = model.policy_record(&outputs[0]).unwrap().state_value;
    assert!((truncated_value - expected_value).abs() < 1e-6);

    // The retrace target at the truncation step is r + gamma * V(truncated).
    let retrace = replay.retrace_value(last_index).unwrap();
    assert!((retrace - (last_reward + GAMMA * truncated_value)).abs() < 1e-6);
}

#[test]
fn reward_sigma_converges_to_the_streamed_distribution() {
    let config = config()
        .reward_rescaling_enabled(true)
        .experience_replay_maximum_size(2048)
        .experience_replay_start_size(64);
    let mut agent = agent(&config);
    let mut rng = ChaCha12Rng::seed_from_u64(2);
    let normal = Normal::new(0.0f32, 2.0).unwrap();

    for _ in 0..100 {
        let mut episode = scripted_episode(&mut rng, 10);
        for e in episode.experiences.iter_mut() {
            e.reward = normal.sample(&mut rng);
        }
        agent.process_episode(episode).unwrap();
    }

    let sigma = agent.replay().reward_sigma(0);
    assert!(
        (1.9..=2.1).contains(&sigma),
        "sigma {sigma} out of [1.9, 2.1]"
    );
}

#[test]
fn out_of_bound_actions_are_penalized_before_rescaling() {
    let config = config()
        .reward_outbound_penalization_enabled(true)
        .reward_outbound_penalization_factor(0.5)
        .variables(vec![
            VariableConfig::state("position"),
            VariableConfig::action("force", 0.0, 1.0),
        ]);
    let mut agent = agent(&config);

    let mut rng = ChaCha12Rng::seed_from_u64(3);
    let mut episode = scripted_episode(&mut rng, 1);
    episode.experiences[0].action = vec![1.5];
    episode.experiences[0].reward = 10.0;
    agent.process_episode(episode).unwrap();

    assert_eq!(agent.replay().reward(0).unwrap(), 5.0);
    assert_eq!(agent.out_of_bound_count(), 1);
}

#[test]
fn first_policy_update_waits_for_the_start_size() {
    let mut agent = agent(&config());
    let mut rng = ChaCha12Rng::seed_from_u64(4);

    // 60 experiences: below the start size of 64.
    for _ in 0..6 {
        agent.process_episode(scripted_episode(&mut rng, 10)).unwrap();
    }
    assert!(!agent.ready_to_train());

    agent.process_episode(scripted_episode(&mut rng, 10)).unwrap();
    assert!(agent.ready_to_train());
    assert!(agent.train_policy().is_ok());
    assert_eq!(agent.policy_update_count(), 1);
}

#[test]
fn on_policy_replay_relaxes_cutoff_and_learning_rate() {
    let config = config();
    let mut agent = agent(&config);

    // Episodes whose actions are sampled from the agent's own engine, so
    // every refreshed importance weight is exactly one.
    let model = ContinuousPolicy::new(vec![-1.0], vec![1.0], vec![0.5]);
    let mut twin = MlpEngine::build(1, &[8], model.output_dim(), "Adam", 13).unwrap();
    let mut rng = ChaCha12Rng::seed_from_u64(5);
    for _ in 0..8 {
        let mut experiences = vec![];
        for pos in 0..10 {
            let state = vec![rng.gen_range(-1.0f32..1.0)];
            let outputs = twin.forward(&[vec![state.clone()]]).unwrap();
            let record = model.policy_record(&outputs[0]).unwrap();
            let (action, exp_policy) = model.sample_action(&record, &mut rng);
            experiences.push(Experience {
                state,
                action,
                reward: 0.1,
                episode_id: 0,
                episode_pos: pos,
                environment_id: 0,
                termination: if pos == 9 {
                    Termination::Terminal
                } else {
                    Termination::NonTerminal
                },
                truncated_state: None,
                exp_policy,
            });
        }
        agent
            .process_episode(CollectedEpisode {
                environment_id: 0,
                experiences,
            })
            .unwrap();
    }

    let cutoff0 = agent.controller().cutoff();
    let lr0 = agent.controller().learning_rate();
    let beta0 = agent.controller().beta();
    agent.train_policy().unwrap();

    assert_eq!(agent.replay().off_policy_count(), 0);
    assert!(agent.controller().cutoff() > cutoff0);
    assert!(agent.controller().learning_rate() > lr0);
    assert!(agent.controller().beta() < beta0);
}

#[test]
fn checkpoints_round_trip_byte_identically() {
    let mut agent = agent(&config());
    let mut rng = ChaCha12Rng::seed_from_u64(6);
    for _ in 0..8 {
        agent.process_episode(scripted_episode(&mut rng, 10)).unwrap();
    }
    for _ in 0..3 {
        agent.train_policy().unwrap();
    }

    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("a.json");
    let second = dir.path().join("b.json");
    agent.save_checkpoint(&first).unwrap();

    let restored: Vracer<ContinuousPolicy, MlpEngine> =
        Vracer::restore_checkpoint(&first).unwrap();
    restored.save_checkpoint(&second).unwrap();

    let a = std::fs::read(&first).unwrap();
    let b = std::fs::read(&second).unwrap();
    assert_eq!(a, b);
}

#[test]
fn restored_training_continues_bit_for_bit() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checkpoint.json");

    // Control run: train through both phases without interruption.
    let mut control = agent(&config());
    let mut rng = ChaCha12Rng::seed_from_u64(7);
    for _ in 0..8 {
        control.process_episode(scripted_episode(&mut rng, 10)).unwrap();
    }
    for _ in 0..2 {
        control.train_policy().unwrap();
    }
    control.save_checkpoint(&path).unwrap();
    for _ in 0..2 {
        control.process_episode(scripted_episode(&mut rng, 10)).unwrap();
    }
    for _ in 0..2 {
        control.train_policy().unwrap();
    }

    // Restarted run: restore, then replay the identical episode stream.
    let mut restored: Vracer<ContinuousPolicy, MlpEngine> =
        Vracer::restore_checkpoint(&path).unwrap();
    let mut rng = ChaCha12Rng::seed_from_u64(7);
    for _ in 0..8 {
        scripted_episode(&mut rng, 10); // burn the pre-checkpoint stream
    }
    for _ in 0..2 {
        restored.process_episode(scripted_episode(&mut rng, 10)).unwrap();
    }
    for _ in 0..2 {
        restored.train_policy().unwrap();
    }

    assert_eq!(
        control.policy_snapshot(0, false).params,
        restored.policy_snapshot(0, false).params
    );
    assert_eq!(control.experience_count(), restored.experience_count());
    assert_eq!(
        control.average_training_reward(),
        restored.average_training_reward()
    );
}
