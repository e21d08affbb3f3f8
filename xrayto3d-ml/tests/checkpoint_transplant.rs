//! Integration tests: trainer checkpoints on disk grafted into bare networks.

use std::path::{Path, PathBuf};
use tempfile::TempDir;
use xrayto3d_ml::checkpoint::{
    Checkpoint, CheckpointManager, ParamPath, StateDict, TensorRecord, load_checkpoint,
    resolve_checkpoint, transplant_autoencoder, transplant_predictor,
};
use xrayto3d_ml::losses::{LossContext, LossKind, build_loss};
use xrayto3d_ml::zoo::{Architecture, ModelLayout, Network, build_model};
use xrayto3d_ml::{Anatomy, MlError};

/// `describe` output for the 64^3 autoencoder, trimmed to a few layers.
const DESCRIBED_AUTOENCODER: &str = include_str!("fixtures/describe_custom_autoencoder_64.json");

fn described_autoencoder() -> ModelLayout {
    serde_json::from_str(DESCRIBED_AUTOENCODER).unwrap()
}

/// Wrap parameters the way the trainer module stores them, with an optional loss
/// buffer named relative to `loss_function`.
fn trainer_state(parameters: StateDict, loss_buffer: Option<&str>, size: usize) -> Checkpoint {
    let mut state = StateDict::new();
    for (path, tensor) in parameters {
        let nested = ParamPath::from_segments(
            std::iter::once("model".to_string()).chain(path.segments().iter().cloned()),
        )
        .unwrap();
        state.insert(nested, tensor);
    }
    if let Some(buffer) = loss_buffer {
        state.insert(
            format!("loss_function.{buffer}").parse().unwrap(),
            TensorRecord::from_f32(&[1, size, size, size], &vec![612.0; size * size * size])
                .unwrap(),
        );
    }
    Checkpoint::new(state).with_metadata("epoch", "12")
}

fn trainer_checkpoint(network: &Network, loss_buffer: Option<&str>) -> Checkpoint {
    trainer_state(network.zeroed_state_dict(), loss_buffer, network.image_size())
}

fn write(dir: &Path, name: &str, checkpoint: &Checkpoint) -> PathBuf {
    let path = dir.join(name);
    checkpoint.save(&path).unwrap();
    path
}

#[test]
fn autoencoder_checkpoint_transplants_strictly() {
    let dir = TempDir::new().unwrap();
    let reference = build_model(Architecture::CustomAutoEncoder, 64, false).unwrap();
    let path = write(
        dir.path(),
        "last.safetensors",
        &trainer_checkpoint(&reference, Some("pos_weight")),
    );

    let on_disk = load_checkpoint(&path).unwrap();
    assert_eq!(on_disk.metadata.get("epoch").map(String::as_str), Some("12"));
    assert!(on_disk.state_dict.contains(&"loss_function.pos_weight".parse().unwrap()));

    let autoencoder = transplant_autoencoder(&path, 64, ModelLayout::of(&reference)).unwrap();
    assert_eq!(autoencoder.architecture(), Architecture::CustomAutoEncoder);
    assert_eq!(autoencoder.weights().len(), reference.layout().len());
    assert!(
        autoencoder
            .weights()
            .keys()
            .all(|k| k.segments()[0] != "model")
    );
}

#[test]
fn autoencoder_trained_with_any_loss_transplants() {
    let dir = TempDir::new().unwrap();
    let reference = build_model(Architecture::CustomAutoEncoder, 64, false).unwrap();
    let ctx = LossContext::new(Anatomy::Femur, 64);
    for kind in LossKind::ALL {
        let loss = build_loss(kind.name(), &ctx).unwrap();
        let name = format!("{kind}.safetensors");
        let path = write(
            dir.path(),
            &name,
            &trainer_checkpoint(&reference, loss.buffer_name()),
        );
        let autoencoder = transplant_autoencoder(&path, 64, ModelLayout::of(&reference))
            .unwrap_or_else(|e| panic!("{kind}: {e}"));
        assert_eq!(autoencoder.weights().len(), reference.layout().len(), "{kind}");
    }
}

#[test]
fn autoencoder_checked_against_described_names() {
    let dir = TempDir::new().unwrap();
    let mut described = build_model(Architecture::CustomAutoEncoder, 64, false).unwrap();
    described.adopt_layout(described_autoencoder()).unwrap();
    let path = write(
        dir.path(),
        "monai.safetensors",
        &trainer_state(described.zeroed_state_dict(), Some("bce.pos_weight"), 64),
    );

    let autoencoder = transplant_autoencoder(&path, 64, described_autoencoder()).unwrap();
    assert_eq!(autoencoder.weights().len(), 12);
    assert!(
        autoencoder
            .weights()
            .contains(&"encode.encode_0.adn.N.running_var".parse().unwrap())
    );

    // Locally derived names are not what this trainer writes.
    let reference = build_model(Architecture::CustomAutoEncoder, 64, false).unwrap();
    let err = transplant_autoencoder(&path, 64, ModelLayout::of(&reference)).unwrap_err();
    assert!(matches!(err, MlError::Load(_)));
    assert!(err.to_string().contains("unexpected keys [decode.decode_0.conv.bias"));
}

#[test]
fn autoencoder_with_missing_weights_fails() {
    let dir = TempDir::new().unwrap();
    let reference = build_model(Architecture::CustomAutoEncoder, 64, false).unwrap();
    let mut checkpoint = trainer_checkpoint(&reference, None);
    let first = checkpoint.state_dict.keys().next().cloned().unwrap();
    checkpoint.state_dict.remove(&first);
    let path = write(dir.path(), "partial.safetensors", &checkpoint);

    let err = transplant_autoencoder(&path, 64, ModelLayout::of(&reference)).unwrap_err();
    assert!(matches!(err, MlError::Load(_)));
    assert!(err.to_string().contains("missing keys"));
}

#[test]
fn autoencoder_size_mismatch_fails() {
    let dir = TempDir::new().unwrap();
    let trained_at_128 = build_model(Architecture::CustomAutoEncoder, 128, false).unwrap();
    let path = write(dir.path(), "ae128.safetensors", &trainer_checkpoint(&trained_at_128, None));

    let reference = build_model(Architecture::CustomAutoEncoder, 64, false).unwrap();
    let err = transplant_autoencoder(&path, 64, ModelLayout::of(&reference)).unwrap_err();
    assert!(err.to_string().contains("size mismatch"));
}

#[test]
fn predictor_tolerates_extra_keys() {
    let dir = TempDir::new().unwrap();
    let reference = build_model(Architecture::TlPredictor, 64, false).unwrap();
    let mut checkpoint = trainer_checkpoint(&reference, Some("pos_weight"));
    checkpoint.state_dict.insert(
        "decoder.latent.weight".parse().unwrap(),
        TensorRecord::zeros(&[4, 4]),
    );
    let path = write(dir.path(), "tl.safetensors", &checkpoint);

    let mut predictor = build_model(Architecture::TlPredictor, 64, false).unwrap();
    let report = transplant_predictor(&path, &mut predictor).unwrap();
    assert_eq!(report.loaded, reference.layout().len());
    assert!(report.missing.is_empty());
    assert_eq!(report.unexpected, vec!["decoder.latent.weight".to_string()]);
}

#[test]
fn missing_autoencoder_checkpoint_is_not_found() {
    let dir = TempDir::new().unwrap();
    let reference = build_model(Architecture::CustomAutoEncoder, 64, false).unwrap();
    let err = transplant_autoencoder(
        &dir.path().join("nope.safetensors"),
        64,
        ModelLayout::of(&reference),
    )
    .unwrap_err();
    assert!(matches!(err, MlError::NotFound(_)));
}

#[test]
fn retention_keeps_best_and_last() {
    let dir = TempDir::new().unwrap();
    let empty = Checkpoint::new(StateDict::new());
    for name in [
        "epoch=1-step=100-val_loss=0.80-val_acc=0.40.safetensors",
        "epoch=2-step=200-val_loss=0.52-val_acc=0.61.safetensors",
        "epoch=3-step=300-val_loss=0.61-val_acc=0.58.safetensors",
        "last.safetensors",
    ] {
        write(dir.path(), name, &empty);
    }

    let manager = CheckpointManager::new(dir.path(), Some(1));
    let removed = manager.enforce_retention().unwrap();
    assert_eq!(removed.len(), 2);

    let mut remaining: Vec<String> = manager
        .list()
        .unwrap()
        .into_iter()
        .filter_map(|e| e.path.file_name().map(|n| n.to_string_lossy().into_owned()))
        .collect();
    remaining.sort();
    assert_eq!(
        remaining,
        vec![
            "epoch=2-step=200-val_loss=0.52-val_acc=0.61.safetensors".to_string(),
            "last.safetensors".to_string(),
        ]
    );
    assert_eq!(
        manager.best().unwrap().map(|e| e.tag.map(|t| t.epoch)),
        Some(Some(2))
    );

    let explicit = dir.path().join("last.safetensors");
    assert_eq!(resolve_checkpoint(&explicit).unwrap(), explicit);
    assert!(resolve_checkpoint(dir.path()).is_ok());
}
