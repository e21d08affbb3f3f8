//! Property-based tests for the model tables and parameter path rewriting.

use proptest::prelude::*;

use xrayto3d_ml::checkpoint::{ParamPath, StateDict, TensorRecord, TransplantPlan};
use xrayto3d_ml::zoo::config::ModelConfig;
use xrayto3d_ml::zoo::{Architecture, build_model, model_config};

fn architecture() -> impl Strategy<Value = Architecture> {
    prop::sample::select(Architecture::ALL.to_vec())
}

fn segment() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,8}"
}

fn param_path() -> impl Strategy<Value = ParamPath> {
    prop::collection::vec(segment(), 1..5)
        .prop_map(|segments| ParamPath::from_segments(segments).unwrap())
}

// --- Model configuration tables ---

proptest! {
    #[test]
    fn every_architecture_builds_at_supported_sizes(
        arch in architecture(),
        size in prop::sample::select(vec![64usize, 128]),
        dropout in any::<bool>(),
    ) {
        let config = model_config(arch, size, dropout).unwrap();
        prop_assert_eq!(config.architecture(), arch);
        prop_assert!(config.validate().is_ok());

        let network = build_model(arch, size, dropout).unwrap();
        prop_assert!(!network.layout().is_empty());
        prop_assert!(network.parameter_count() > 0);
        prop_assert_eq!(network.zeroed_state_dict().len(), network.layout().len());
    }

    #[test]
    fn size_dependent_models_reject_other_sizes(
        arch in architecture(),
        size in 1usize..512,
    ) {
        prop_assume!(size != 64 && size != 128);
        if arch.is_size_dependent() {
            prop_assert!(model_config(arch, size, false).is_err());
            prop_assert!(build_model(arch, size, false).is_err());
        }
    }

    #[test]
    fn unknown_model_names_are_rejected(name in "[A-Za-z]{1,12}") {
        prop_assume!(Architecture::ALL.iter().all(|a| a.name() != name));
        let err = name.parse::<Architecture>().unwrap_err();
        prop_assert!(err.to_string().contains(&name));
    }
}

#[test]
fn one_d_concat_decoder_grows_by_one_stage() {
    let small = model_config(Architecture::OneDConcatModel, 64, false).unwrap();
    let large = model_config(Architecture::OneDConcatModel, 128, false).unwrap();
    let (ModelConfig::OneDConcat(small), ModelConfig::OneDConcat(large)) = (small, large) else {
        panic!("expected OneDConcat configurations");
    };
    assert_eq!(large.decoder.out_channels.len(), small.decoder.out_channels.len() + 1);
    assert_eq!(large.decoder.in_channels.len(), small.decoder.in_channels.len() + 1);
    assert_eq!(large.decoder.strides.len(), small.decoder.strides.len() + 1);

    for (config, expected) in [(&small, 1024), (&large, 4096)] {
        let embedding = config.decoder.in_channels[0];
        assert_eq!(embedding, expected);
        let depth = config.decoder.depth();
        assert_eq!(
            &config.decoder.in_channels[1..],
            &config.decoder.out_channels[..depth - 1]
        );
    }
}

// --- Parameter path rewriting ---

proptest! {
    #[test]
    fn strip_prefix_undoes_child(base in param_path(), extra in segment()) {
        let nested = ParamPath::from_segments(
            std::iter::once("model".to_string()).chain(base.segments().iter().cloned()),
        ).unwrap();
        prop_assert_eq!(nested.strip_prefix(&"model".parse().unwrap()), Some(base.clone()));

        let child = base.child(&extra);
        prop_assert!(child.starts_with(&base));
        prop_assert_eq!(child.len(), base.len() + 1);
    }

    #[test]
    fn display_parse_roundtrip(path in param_path()) {
        let text = path.to_string();
        prop_assert_eq!(text.parse::<ParamPath>().unwrap(), path);
    }

    #[test]
    fn trainer_module_plan_strips_model_and_drops_loss_buffer(
        keys in prop::collection::btree_set(param_path(), 1..20),
    ) {
        let model: ParamPath = "model".parse().unwrap();
        let buffer: ParamPath = "loss_function.pos_weight".parse().unwrap();
        prop_assume!(keys.iter().all(|k| {
            let head = &k.segments()[0];
            head != "model" && head != "loss_function"
        }));

        let mut state = StateDict::new();
        for key in &keys {
            let nested = ParamPath::from_segments(
                model.segments().iter().chain(key.segments()).cloned(),
            ).unwrap();
            state.insert(nested, TensorRecord::zeros(&[1]));
        }
        state.insert(buffer.clone(), TensorRecord::zeros(&[1, 4, 4, 4]));

        let plan = TransplantPlan::trainer_module().unwrap();
        let (out, summary) = plan.apply(state).unwrap();
        prop_assert_eq!(out.len(), keys.len());
        prop_assert!(!out.contains(&buffer));
        prop_assert!(keys.iter().all(|k| out.contains(k)));
        prop_assert_eq!(summary.renamed, keys.len());
        prop_assert_eq!(summary.dropped, vec![buffer.to_string()]);
    }
}
