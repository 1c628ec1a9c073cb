use std::fs;
use std::path::{Path, PathBuf};

use seqtag_core::{Config, SeqTagError};
use seqtag_trainer::{
    CheckpointStore, CheckpointTag, RunOptions, SequenceTaggerInference, TaggedSentence,
    build_scheduler, run_training,
};

const TRAIN: &str = "\
-DOCSTART- -X- O O

Cu NN B-MATERIAL
is VBZ O
a DT O
metal NN U-MATERIAL

Fe NN U-MATERIAL
rusts VBZ O
";

const CONFIG: &str = r#"
[experiment]
exp_name = "cu_is_a_metal"
exp_dir = "exp"

[dataset]
class = "CoNLLDatasetManager"
train_filename = "data/train.txt"
dev_filename = "data/dev.txt"
test_filename = "data/test.txt"
column_names = ["MATERIAL"]

[model]
class = "RnnSeqCrfTagger"
encoding_dim = 16
tagging_type = "BIOUL"

[model.rnn2seqencoder]
class = "Lstm2SeqEncoder"
dropout_value = 0.5
hidden_dim = 8
bidirectional = true
num_layers = 1
combine_strategy = "concat"
rnn_bias = true

[[model.rnn2seqencoder.embedder]]
class = "WordEmbedder"
embedding_type = "glove_6B_100"

[[model.rnn2seqencoder.embedder]]
class = "CharEmbedder"
char_embedding_dimension = 4
hidden_dimension = 3

[engine]
batch_size = 2
save_dir = "checkpoints"
num_epochs = 1
save_every = 1
log_train_metrics_every = 1
device = "cpu"
gradient_norm_clip_value = 5.0

[engine.metric]
class = "TokenClassificationAccuracy"

[engine.optimizer]
class = "Adam"
lr = 1e-3
"#;

fn workspace(config: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    fs::create_dir_all(&data).unwrap();
    for split in ["train", "dev", "test"] {
        fs::write(data.join(format!("{split}.txt")), TRAIN).unwrap();
    }
    let config_path = dir.path().join("experiment.toml");
    fs::write(&config_path, config).unwrap();
    (dir, config_path)
}

fn options(config: &Path) -> RunOptions {
    RunOptions {
        config: config.to_path_buf(),
        ..RunOptions::default()
    }
}

#[test]
fn one_epoch_on_two_sentence_batch_writes_epoch_one_checkpoint() {
    let (dir, config_path) = workspace(CONFIG);
    let summary = run_training(&options(&config_path)).unwrap();

    assert_eq!(summary.experiment, "cu_is_a_metal");
    assert_eq!(summary.epochs_completed, 1);
    // Both sentences fit in one padded batch.
    assert_eq!(summary.global_step, 1);
    assert_eq!(summary.optimizer_step, 1);

    let epoch_dir = dir.path().join("checkpoints").join(CheckpointTag::Epoch(1).dir_name());
    let loaded = CheckpointStore::load(&epoch_dir, &candle_core::Device::Cpu).unwrap();
    assert_eq!(loaded.manifest.epoch, 1);
    assert_eq!(loaded.manifest.global_step, 1);
    assert!(loaded.vocab.words.contains("metal"));
    assert!(dir.path().join("checkpoints/latest/model.safetensors").is_file());
}

#[test]
fn saved_checkpoint_tags_new_text() {
    let (dir, config_path) = workspace(CONFIG);
    run_training(&options(&config_path)).unwrap();

    let config = Config::from_path(&config_path).unwrap();
    let tagger =
        SequenceTaggerInference::from_checkpoint(&config, dir.path().join("checkpoints/latest"))
            .unwrap();

    let prediction = tagger.predict_tokens(&["Cu", "is", "a", "metal"]).unwrap();
    assert_eq!(prediction.labels.len(), 4);
    assert!(
        prediction
            .labels
            .iter()
            .all(|label| tagger.labels().index_of(label).is_some())
    );
    // Decoding is constrained, so the path is always well formed.
    let ids: Vec<usize> = prediction
        .labels
        .iter()
        .filter_map(|label| tagger.labels().index_of(label))
        .collect();
    assert!(tagger.labels().is_valid_sequence(&ids));

    let from_text = tagger.predict_text("Zn is a metal.").unwrap();
    assert_eq!(from_text.tokens, vec!["Zn", "is", "a", "metal", "."]);
    assert_eq!(from_text.offsets.as_ref().unwrap()[3], (8, 13));

    assert!(matches!(
        tagger.predict_text("   ").unwrap_err(),
        SeqTagError::EmptyInput
    ));
}

#[test]
fn checkpoint_evaluates_the_test_split() {
    let (dir, config_path) = workspace(CONFIG);
    run_training(&options(&config_path)).unwrap();

    let config = Config::from_path(&config_path).unwrap();
    let tagger =
        SequenceTaggerInference::from_checkpoint(&config, dir.path().join("checkpoints/latest"))
            .unwrap();

    let evaluation = tagger.evaluate_test_split().unwrap();
    assert_eq!(evaluation.sentences.len(), 2);
    assert_eq!(evaluation.sentences[0].gold, vec!["B-MATERIAL", "O", "O", "U-MATERIAL"]);
    assert_eq!(evaluation.sentences[1].gold, vec!["U-MATERIAL", "O"]);
    for (gold, predicted) in evaluation.true_labels().iter().zip(evaluation.predicted_labels()) {
        assert_eq!(gold.len(), predicted.len());
    }

    assert_eq!(evaluation.confusion.total(), 6);
    let u_material: usize = tagger
        .labels()
        .tags()
        .iter()
        .map(|tag| evaluation.confusion.count("U-MATERIAL", &tag.to_string()))
        .sum();
    assert_eq!(u_material, 2);

    for sentence in &evaluation.sentences {
        for (gold, predicted) in sentence.gold.iter().zip(&sentence.predicted) {
            if gold != predicted {
                assert!(!sentence.is_correct());
                assert!(evaluation.misclassified(gold, predicted).contains(&sentence));
            }
        }
    }

    let report = evaluation.report();
    assert!((0.0..=1.0).contains(&report["accuracy"]));
    assert!(report.contains_key("fscore_MATERIAL"));
    let types = evaluation.type_scores();
    assert_eq!(types.len(), 1);
    assert_eq!(types[0].entity, "MATERIAL");
    assert!(evaluation.spans.render_table().contains("MATERIAL"));
    assert_eq!(evaluation.confusion.render_table().lines().count(), 1 + 5);
}

#[test]
fn evaluation_converts_bio_and_truncates_long_words() {
    let (dir, config_path) = workspace(CONFIG);
    run_training(&options(&config_path)).unwrap();

    let mut config = Config::from_path(&config_path).unwrap();
    config.dataset.max_char_length = Some(3);
    let tagger =
        SequenceTaggerInference::from_checkpoint(&config, dir.path().join("checkpoints/latest"))
            .unwrap();

    let annotated = [TaggedSentence::new(
        &["Stainless", "steel", "corrodes"],
        &["B-MATERIAL", "I-MATERIAL", "O"],
    )];
    let evaluation = tagger.evaluate(&annotated).unwrap();
    assert_eq!(evaluation.true_labels()[0], ["B-MATERIAL", "L-MATERIAL", "O"]);
    assert_eq!(evaluation.sentences[0].tokens[0], "Stainless");

    let prediction = tagger.predict_tokens(&["Aluminium", "is", "light"]).unwrap();
    assert_eq!(prediction.tokens[0], "Aluminium");
}

#[test]
fn resume_from_cli_options_continues_counters() {
    let (dir, config_path) = workspace(CONFIG);
    run_training(&options(&config_path)).unwrap();

    fs::write(&config_path, CONFIG.replace("num_epochs = 1", "num_epochs = 3")).unwrap();
    let summary = run_training(&RunOptions {
        config: config_path.clone(),
        resume: Some(dir.path().join("checkpoints/epoch_0001")),
        device: Some("cpu".to_string()),
    })
    .unwrap();
    assert_eq!(summary.epochs_completed, 3);
    assert_eq!(summary.optimizer_step, 3);
    assert!(dir.path().join("checkpoints/epoch_0003").is_dir());
}

#[test]
fn invalid_configuration_names_the_field() {
    let (_dir, config_path) = workspace(&CONFIG.replace("num_layers = 1", "num_layers = 0"));
    let err = run_training(&options(&config_path)).unwrap_err();
    assert!(format!("{err:#}").contains("model.rnn2seqencoder.num_layers"));
}

#[test]
fn unknown_embedder_class_is_fatal_before_training() {
    let (dir, config_path) =
        workspace(&CONFIG.replace("class = \"CharEmbedder\"", "class = \"ElmoEmbedder\""));
    let err = run_training(&options(&config_path)).unwrap_err();
    assert!(format!("{err:#}").contains("ElmoEmbedder"));
    assert!(!dir.path().join("checkpoints").exists());
}

#[test]
fn sample_configuration_parses_and_validates() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../configs/conll_bioul_crf.toml");
    let config = Config::from_path(path).unwrap();
    assert_eq!(config.label_set().unwrap().len(), 5);
    assert_eq!(config.engine.track_for_best, "macro_fscore");
    assert_eq!(config.dataset.max_char_length, Some(30));

    let node = config.engine.lr_scheduler.as_ref().unwrap();
    assert_eq!(build_scheduler(node, false).unwrap().name(), "ReduceLROnPlateau");
}
