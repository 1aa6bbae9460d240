//! Training and inference runs through the backend on simulated devices

use graft_compiler::{Graph, HostTensor, Scope, VarType, WeightStore};
use graft_runtime::{
    step_checkpoint_name, Backend, RuntimeError, SessionSnapshot, SimDeviceManager, Strategy,
    INIT_CHECKPOINT,
};

/// `loss = mean(relu(x * w))`
fn regression_graph() -> Graph {
    let mut graph = Graph::new();
    graph.add_var("x").shape(vec![2, 3]).dtype(VarType::Fp32).finish();
    graph
        .add_var("w")
        .shape(vec![2, 3])
        .dtype(VarType::Fp32)
        .persistable(true)
        .finish();
    graph
        .add_op("elementwise_mul")
        .input("X", &["x"])
        .input("Y", &["w"])
        .output("Out", &["xw"])
        .finish()
        .unwrap();
    graph
        .add_op("relu")
        .input("X", &["xw"])
        .output("Out", &["act"])
        .finish()
        .unwrap();
    graph
        .add_op("mean")
        .input("X", &["act"])
        .output("Out", &["loss"])
        .finish()
        .unwrap();
    graph
}

fn weights() -> Scope {
    let mut scope = Scope::new();
    scope.set("w", HostTensor::from_f32(vec![2, 3], &[1.0; 6]).unwrap());
    scope.set("learning_rate", HostTensor::scalar_f32(0.125));
    scope
}

fn training_backend(strategy: Strategy) -> (Backend, graft_runtime::sim::SharedStats) {
    let manager = SimDeviceManager::new(1);
    let stats = manager.stats();
    let mut backend = Backend::new(strategy, Box::new(manager));
    backend.attach_device(0).unwrap();
    (backend, stats)
}

fn run_steps(backend: &mut Backend, scope: &mut Scope, steps: usize) {
    let x = HostTensor::from_f32(vec![2, 3], &[1.0; 6]).unwrap();
    let mut outputs = vec![HostTensor::empty(VarType::Fp32)];
    for _ in 0..steps {
        backend.run(&[&x], &mut outputs, scope).unwrap();
    }
}

#[test]
fn test_unset_optimizer_fails_before_any_device_call() {
    let dir = tempfile::tempdir().unwrap();
    let (mut backend, stats) =
        training_backend(Strategy::training().with_checkpoint_dir(dir.path()));
    backend.executor_mut().set_loss("loss");

    let mut scope = weights();
    let mut graph = regression_graph();
    backend.compile(&mut graph, &["x"], &["loss"], &scope).unwrap();

    let x = HostTensor::zeros(VarType::Fp32, vec![2, 3]);
    let mut outputs = vec![HostTensor::empty(VarType::Fp32)];
    let err = backend.run(&[&x], &mut outputs, &mut scope).unwrap_err();
    assert!(matches!(err, RuntimeError::PreconditionNotMet(ref m) if m.contains("type not set")));

    let stats = stats.lock();
    assert_eq!(stats.sessions_created, 0);
    assert_eq!(stats.weights_written, 0);
}

#[test]
fn test_periodic_weight_pulls_and_step_snapshots() {
    const N: u64 = 3;
    let dir = tempfile::tempdir().unwrap();
    let strategy = Strategy::training()
        .with_save_per_n_step(N as usize)
        .with_step_checkpoints(true)
        .with_checkpoint_dir(dir.path());
    let (mut backend, stats) = training_backend(strategy);
    {
        let executor = backend.executor_mut();
        executor.set_optimizer_type("sgd");
        executor.set_loss("loss");
        executor.set_lr_var_name("learning_rate");
    }

    let mut scope = weights();
    let mut graph = regression_graph();
    backend.compile(&mut graph, &["x"], &["loss"], &scope).unwrap();
    run_steps(&mut backend, &mut scope, 2 * N as usize);

    let stats = stats.lock().clone();
    assert_eq!(stats.runs, 2 * N as usize);
    assert_eq!(stats.weights_to_host, 2);
    let expected: Vec<_> = [N, 2 * N]
        .iter()
        .map(|&step| dir.path().join(step_checkpoint_name(step)))
        .collect();
    assert_eq!(stats.exports, expected);
    assert_eq!(backend.executor().step(), 2 * N);

    // six unit-gradient steps at lr 0.125
    let w = scope.find("w").unwrap().to_f32_vec().unwrap();
    assert_eq!(w, vec![0.25; 6]);

    let last = SessionSnapshot::load(&expected[1]).unwrap();
    assert_eq!(last.step, 2 * N);
    assert!(dir.path().join("model_compiled.bin").exists());
}

#[test]
fn test_init_snapshot_and_inference_never_pulls() {
    let dir = tempfile::tempdir().unwrap();
    let strategy = Strategy::inference()
        .with_init_checkpoint(true)
        .with_checkpoint_dir(dir.path());
    let (mut backend, stats) = training_backend(strategy);

    let mut scope = weights();
    let mut graph = regression_graph();
    backend.compile(&mut graph, &["x"], &["loss"], &scope).unwrap();
    run_steps(&mut backend, &mut scope, 4);

    let stats = stats.lock().clone();
    assert_eq!(stats.exports, vec![dir.path().join(INIT_CHECKPOINT)]);
    assert_eq!(stats.weights_to_host, 0);
    assert_eq!(stats.optimizer_updates, 0);
    assert_eq!(stats.training_sessions, 0);
    assert_eq!(scope.find("w").unwrap().to_f32_vec().unwrap(), vec![1.0; 6]);
}

#[test]
fn test_output_shape_gains_batches_per_step() {
    let dir = tempfile::tempdir().unwrap();
    let strategy = Strategy::inference()
        .with_batches_per_step(5)
        .with_checkpoint_dir(dir.path());
    let (mut backend, _) = training_backend(strategy);

    let mut scope = weights();
    let mut graph = regression_graph();
    backend.compile(&mut graph, &["x"], &["act"], &scope).unwrap();
    assert_eq!(backend.tensor_shape("act").unwrap(), vec![5, 2, 3]);

    let x = HostTensor::zeros(VarType::Fp32, vec![5, 2, 3]);
    let mut outputs = vec![HostTensor::empty(VarType::Fp32)];
    backend.run(&[&x], &mut outputs, &mut scope).unwrap();
    assert_eq!(outputs[0].shape(), &[5, 2, 3]);
    assert_eq!(outputs[0].data().len(), 5 * 2 * 3 * 4);
}

mod property_based_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_output_shape_is_batches_then_compiled(
            k in 2usize..6,
            a in 1i64..5,
            b in 1i64..5,
        ) {
            let mut graph = Graph::new();
            graph.add_var("x").shape(vec![a, b]).dtype(VarType::Fp32).finish();
            graph
                .add_op("tanh")
                .input("X", &["x"])
                .output("Out", &["y"])
                .finish()
                .unwrap();

            let dir = tempfile::tempdir().unwrap();
            let strategy = Strategy::inference()
                .with_batches_per_step(k)
                .with_checkpoint_dir(dir.path());
            let mut backend = Backend::new(strategy, Box::new(SimDeviceManager::new(1)));
            backend.attach_device(0).unwrap();

            let mut scope = Scope::new();
            backend.compile(&mut graph, &["x"], &["y"], &scope).unwrap();
            let x = HostTensor::zeros(VarType::Fp32, vec![k as i64, a, b]);
            let mut outputs = vec![HostTensor::empty(VarType::Fp32)];
            backend.run(&[&x], &mut outputs, &mut scope).unwrap();
            prop_assert_eq!(outputs[0].shape(), &[k as i64, a, b][..]);
        }
    }
}
