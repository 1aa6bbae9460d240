//! Strategy file → compile → train → reload weights

use graft::prelude::*;
use graft::runtime::{step_checkpoint_name, SessionSnapshot};
use std::io::Write;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Two-layer classifier over 8 features and 4 classes
fn classifier() -> Graph {
    let mut graph = Graph::new();
    graph.add_var("image").shape(vec![2, 8]).dtype(VarType::Fp32).finish();
    graph.add_var("label").shape(vec![2, 1]).dtype(VarType::Int64).finish();
    for (name, shape) in [("fc_w", vec![8, 4]), ("fc_b", vec![4])] {
        graph
            .add_var(name)
            .shape(shape)
            .dtype(VarType::Fp32)
            .persistable(true)
            .finish();
    }
    graph
        .add_op("matmul_v2")
        .input("X", &["image"])
        .input("Y", &["fc_w"])
        .output("Out", &["fc_out"])
        .finish()
        .unwrap();
    graph
        .add_op("elementwise_add")
        .input("X", &["fc_out"])
        .input("Y", &["fc_b"])
        .output("Out", &["logits"])
        .attr("axis", 1i64)
        .finish()
        .unwrap();
    graph
        .add_op("softmax")
        .input("X", &["logits"])
        .output("Out", &["probs"])
        .finish()
        .unwrap();
    graph
        .add_op("cross_entropy2")
        .input("X", &["probs"])
        .input("Label", &["label"])
        .output("Y", &["ce"])
        .finish()
        .unwrap();
    graph
        .add_op("mean")
        .input("X", &["ce"])
        .output("Out", &["loss"])
        .finish()
        .unwrap();
    graph
}

#[test]
fn test_strategy_file_drives_training_run() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
        [graft]
        is_training = true
        save_per_n_step = 2
        save_last_checkpoint = true
        use_model_device = true
        checkpoint_dir = "{}"
        "#,
        dir.path().display()
    )
    .unwrap();
    let strategy = Strategy::load(file.path()).unwrap();

    let mut backend = Backend::new(strategy, Box::new(SimDeviceManager::new(0)));
    backend.attach_device(0).unwrap();
    {
        let executor = backend.executor_mut();
        executor.set_optimizer_type("adam");
        executor.set_lr(0.5);
        executor.set_optimizer_attr("beta1", 0.8);
        executor.set_loss("loss");
    }

    let mut scope = Scope::new();
    scope.set("fc_w", HostTensor::from_f32(vec![8, 4], &[1.0; 32]).unwrap());
    scope.set("fc_b", HostTensor::from_f32(vec![4], &[1.0; 4]).unwrap());
    scope.set("fc_w_moment1_0", HostTensor::zeros(VarType::Fp32, vec![8, 4]));

    let mut graph = classifier();
    let program = backend
        .compile(&mut graph, &["image", "label"], &["loss", "probs"], &scope)
        .unwrap();
    assert_eq!(program.inputs.len(), 2);

    let image = HostTensor::from_f32(vec![2, 8], &[0.5; 16]).unwrap();
    let label = HostTensor::from_i64(vec![2, 1], &[1, 3]).unwrap();
    let mut outputs = vec![
        HostTensor::empty(VarType::Fp32),
        HostTensor::empty(VarType::Fp32),
    ];
    for _ in 0..4 {
        backend.run(&[&image, &label], &mut outputs, &mut scope).unwrap();
    }

    assert_eq!(outputs[0].shape(), &[1]);
    assert_eq!(outputs[1].shape(), &[2, 4]);
    // fc_w, its first moment and fc_b move; the second moment has no host copy
    assert_eq!(backend.executor().weights_io().len(), 3);
    assert_eq!(scope.find("fc_b").unwrap().to_f32_vec().unwrap(), vec![-1.0; 4]);

    let snapshot = SessionSnapshot::load(&dir.path().join(step_checkpoint_name(4))).unwrap();
    assert_eq!(snapshot.step, 4);
    assert!(snapshot.optimizer.is_some());

    backend.detach_device();
    assert!(!backend.is_attached());
}

#[test]
fn test_inference_skips_missing_feed() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let strategy = Strategy::inference()
        .with_model_device(true)
        .with_checkpoint_dir(dir.path());
    let mut backend = Backend::new(strategy, Box::new(SimDeviceManager::new(0)));
    backend.attach_device(0).unwrap();

    let mut scope = Scope::new();
    scope.set("fc_w", HostTensor::from_f32(vec![8, 4], &[0.0; 32]).unwrap());
    scope.set("fc_b", HostTensor::from_f32(vec![4], &[0.0; 4]).unwrap());

    let mut graph = classifier();
    let program = backend
        .compile(&mut graph, &["image", "not_a_feed", "label"], &["probs"], &scope)
        .unwrap();
    assert_eq!(program.inputs.len(), 2);

    let image = HostTensor::zeros(VarType::Fp32, vec![2, 8]);
    let label = HostTensor::from_i64(vec![2, 1], &[0, 0]).unwrap();
    let mut outputs = vec![HostTensor::empty(VarType::Fp32)];
    backend.run(&[&image, &label], &mut outputs, &mut scope).unwrap();
    assert_eq!(outputs[0].shape(), &[2, 4]);
}
