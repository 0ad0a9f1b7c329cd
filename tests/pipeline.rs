//! End-to-end scenarios for the pipeline runtime: tag flow between nodes,
//! clobber detection, token contention and resume.

use graphmill::{
    pipeline::{
        GraphBuilder, JobDriver, JobOptions, LiteralConditions, Node, NodeDisposition,
        ScriptContext, TempStorage, TokenStore,
    },
    pipeline::task::{SourceLocation, TaskInfo},
    BuildError,
};
use std::{
    collections::BTreeSet,
    fs,
    path::PathBuf,
};

fn task(name: &str, args: &[(&str, &str)], line: u32) -> TaskInfo {
    TaskInfo {
        name: name.to_string(),
        arguments: args.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        location: SourceLocation::new("job.xml", line),
    }
}

fn node(name: &str, inputs: &[&str], outputs: &[&str], tasks: Vec<TaskInfo>) -> Node {
    Node {
        name: name.to_string(),
        inputs: inputs.iter().map(|s| s.to_string()).collect(),
        outputs: outputs.iter().map(|s| s.to_string()).collect(),
        tasks,
        after: Vec::new(),
        required_tokens: Vec::new(),
        controlling_trigger: None,
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    root: PathBuf,
    context: ScriptContext,
    registry: graphmill::pipeline::TaskRegistry,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("workspace");
        fs::create_dir_all(&root).unwrap();
        let context = ScriptContext::new(&root);
        Self { _dir: dir, root, context, registry: graphmill::pipeline::standard_registry() }
    }

    fn storage(&self) -> TempStorage {
        TempStorage::new(&self.root, self._dir.path().join("storage"), None, false)
    }

    fn driver<'a>(
        &'a self,
        graph: &'a graphmill::pipeline::Graph,
        options: JobOptions,
        signature: &str,
    ) -> JobDriver<'a> {
        JobDriver {
            graph,
            context: &self.context,
            conditions: &LiteralConditions,
            registry: &self.registry,
            storage: self.storage(),
            tokens: TokenStore::new(signature),
            options,
        }
    }

    fn write(&self, rel: &str, contents: &str) -> PathBuf {
        let path = self.root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, contents).unwrap();
        path
    }
}

fn targets(names: &[&str]) -> JobOptions {
    JobOptions { targets: names.iter().map(|s| s.to_string()).collect(), ..Default::default() }
}

#[test]
fn tag_sets_flow_between_nodes() {
    let fx = Fixture::new();
    fx.write("src/foo.bin", "artifact payload");

    let graph = GraphBuilder::new()
        .agent("Agent")
        .node(node(
            "Produce",
            &[],
            &["#Artifacts"],
            vec![task("Copy", &[("Files", "src/foo.bin"), ("To", "out"), ("Tag", "#Artifacts")], 3)],
        ))
        .node(node(
            "Consume",
            &["#Artifacts"],
            &[],
            vec![task("Copy", &[("Files", "#Artifacts"), ("To", "staged")], 7)],
        ))
        .build();

    let driver = fx.driver(&graph, targets(&["Consume"]), "job-1");
    let outcome = driver.run().unwrap();
    assert_eq!(outcome.dispositions["Produce"], NodeDisposition::Executed);
    assert_eq!(outcome.dispositions["Consume"], NodeDisposition::Executed);

    // the produced tag lists foo.bin out of exactly one block
    let list = fx.storage().read_file_list("Produce", "#Artifacts").unwrap();
    assert_eq!(list.files, vec!["out/foo.bin"]);
    assert_eq!(list.blocks.len(), 1);
    assert_eq!(list.blocks[0].node, "Produce");

    // and the consumer staged it
    assert_eq!(
        fs::read_to_string(fx.root.join("staged/foo.bin")).unwrap(),
        "artifact payload"
    );
}

#[test]
fn modifying_an_input_is_a_clobber_failure() {
    let fx = Fixture::new();
    fx.write("src/foo.bin", "artifact payload");

    let graph = GraphBuilder::new()
        .agent("Agent")
        .node(node(
            "Produce",
            &[],
            &["#Artifacts"],
            vec![task("Copy", &[("Files", "src/foo.bin"), ("To", "out"), ("Tag", "#Artifacts")], 3)],
        ))
        .node(node(
            "Damage",
            &["#Artifacts"],
            &[],
            // scribbles over its input in place
            vec![task(
                "Spawn",
                &[("Exe", "/bin/sh"), ("Arguments", "-c \"echo damaged > out/foo.bin\"")],
                9,
            )],
        ))
        .build();

    let driver = fx.driver(&graph, targets(&["Damage"]), "job-1");
    let err = driver.run().unwrap_err();
    let BuildError::Clobbered { node, files } = err else { panic!("expected clobber, got {err}") };
    assert_eq!(node, "Damage");
    assert_eq!(files, vec![fx.root.join("out/foo.bin")]);
}

#[test]
fn token_contention_fails_fast_or_skips() {
    let fx = Fixture::new();
    fx.write("src/foo.bin", "artifact");
    let token = fx._dir.path().join("tokens/exclusive.token");

    let make_graph = || {
        let mut gated = node(
            "Gated",
            &[],
            &[],
            vec![task("Copy", &[("Files", "src/foo.bin"), ("To", "out")], 3)],
        );
        gated.required_tokens = vec![token.clone()];
        GraphBuilder::new().agent("Agent").node(gated).build()
    };

    // another driver owns the token already
    let owner = TokenStore::new("other-job");
    assert_eq!(
        owner.try_acquire(&token).unwrap(),
        graphmill::pipeline::TokenState::Acquired
    );

    // fail-fast policy reports the owner
    let graph = make_graph();
    let driver = fx.driver(&graph, targets(&["Gated"]), "job-1");
    let err = driver.run().unwrap_err();
    let BuildError::TokenContention { owner, .. } = err else { panic!("wrong error: {err}") };
    assert_eq!(owner, "other-job");

    // skip policy drops the node and succeeds
    let graph = make_graph();
    let options = JobOptions { skip_targets_without_tokens: true, ..targets(&["Gated"]) };
    let driver = fx.driver(&graph, options, "job-1");
    let outcome = driver.run().unwrap();
    assert!(matches!(outcome.dispositions["Gated"], NodeDisposition::MissingToken(_)));
    assert!(!fx.root.join("out/foo.bin").exists());
}

#[test]
fn winner_takes_the_token_and_dependents_are_dropped_too() {
    let fx = Fixture::new();
    fx.write("src/foo.bin", "artifact");
    let token = fx._dir.path().join("tokens/exclusive.token");

    let mut produce = node(
        "Produce",
        &[],
        &["#Artifacts"],
        vec![task("Copy", &[("Files", "src/foo.bin"), ("To", "out"), ("Tag", "#Artifacts")], 3)],
    );
    produce.required_tokens = vec![token.clone()];
    let graph = GraphBuilder::new()
        .agent("Agent")
        .node(produce)
        .node(node(
            "Consume",
            &["#Artifacts"],
            &[],
            vec![task("Copy", &[("Files", "#Artifacts"), ("To", "staged")], 7)],
        ))
        .build();

    let winner = TokenStore::new("winner");
    winner.try_acquire(&token).unwrap();
    assert_eq!(graphmill::pipeline::read_owner(&token).unwrap().as_deref(), Some("winner"));

    let options = JobOptions { skip_targets_without_tokens: true, ..targets(&["Consume"]) };
    let driver = fx.driver(&graph, options, "loser");
    let outcome = driver.run().unwrap();
    assert!(matches!(outcome.dispositions["Produce"], NodeDisposition::MissingToken(_)));
    assert!(matches!(outcome.dispositions["Consume"], NodeDisposition::MissingToken(_)));
}

#[test]
fn resume_skips_complete_nodes_until_outputs_drift() {
    let fx = Fixture::new();
    fx.write("src/foo.bin", "artifact payload");

    let make_graph = || {
        GraphBuilder::new()
            .agent("Agent")
            .node(node(
                "Produce",
                &[],
                &["#Artifacts"],
                vec![task(
                    "Copy",
                    &[("Files", "src/foo.bin"), ("To", "out"), ("Tag", "#Artifacts")],
                    3,
                )],
            ))
            .build()
    };

    let graph = make_graph();
    let driver = fx.driver(&graph, targets(&["Produce"]), "job-1");
    driver.run().unwrap();

    // resume skips the completed node
    let graph = make_graph();
    let options = JobOptions { resume: true, ..targets(&["Produce"]) };
    let driver = fx.driver(&graph, options, "job-1");
    let outcome = driver.run().unwrap();
    assert_eq!(outcome.dispositions["Produce"], NodeDisposition::AlreadyComplete);

    // tamper with the published output; the integrity check invalidates
    // the node and it runs again
    fs::write(fx.root.join("out/foo.bin"), "tampered").unwrap();
    let graph = make_graph();
    let options = JobOptions { resume: true, ..targets(&["Produce"]) };
    let driver = fx.driver(&graph, options, "job-1");
    let outcome = driver.run().unwrap();
    assert_eq!(outcome.dispositions["Produce"], NodeDisposition::Executed);
    assert_eq!(fs::read_to_string(fx.root.join("out/foo.bin")).unwrap(), "artifact payload");
}

#[test]
fn triggers_gate_nodes_until_fired() {
    let fx = Fixture::new();
    fx.write("src/foo.bin", "artifact");

    let make_graph = || {
        let mut publish = node(
            "Publish",
            &[],
            &[],
            vec![task("Copy", &[("Files", "src/foo.bin"), ("To", "published")], 3)],
        );
        publish.controlling_trigger = Some("Release".to_string());
        GraphBuilder::new().agent("Agent").node(publish).trigger("Release").build()
    };

    let graph = make_graph();
    let driver = fx.driver(&graph, targets(&["Publish"]), "job-1");
    let outcome = driver.run().unwrap();
    assert_eq!(
        outcome.dispositions["Publish"],
        NodeDisposition::BehindTrigger("Release".to_string())
    );
    assert!(!fx.root.join("published/foo.bin").exists());

    let graph = make_graph();
    let options = JobOptions {
        active_triggers: BTreeSet::from(["Release".to_string()]),
        ..targets(&["Publish"])
    };
    let driver = fx.driver(&graph, options, "job-1");
    let outcome = driver.run().unwrap();
    assert_eq!(outcome.dispositions["Publish"], NodeDisposition::Executed);
    assert!(fx.root.join("published/foo.bin").exists());
}

#[test]
fn list_only_and_export_do_not_execute() {
    let fx = Fixture::new();
    fx.write("src/foo.bin", "artifact");

    let graph = GraphBuilder::new()
        .agent("Agent")
        .node(node(
            "Produce",
            &[],
            &["#Artifacts"],
            vec![task("Copy", &[("Files", "src/foo.bin"), ("To", "out"), ("Tag", "#Artifacts")], 3)],
        ))
        .build();

    let options = JobOptions { list_only: true, show_deps: true, ..targets(&["Produce"]) };
    let driver = fx.driver(&graph, options, "job-1");
    let outcome = driver.run().unwrap();
    assert!(outcome.planned_only);
    assert!(!fx.root.join("out/foo.bin").exists());

    let export = fx._dir.path().join("graph.json");
    let options = JobOptions { export: Some(export.clone()), ..targets(&["Produce"]) };
    let driver = fx.driver(&graph, options, "job-1");
    driver.run().unwrap();
    let value: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&export).unwrap()).unwrap();
    assert_eq!(value["Nodes"][0]["Name"], "Produce");
    assert!(!fx.root.join("out/foo.bin").exists());
}

#[test]
fn unknown_target_is_fatal() {
    let fx = Fixture::new();
    let graph = GraphBuilder::new().agent("Agent").node(node("Only", &[], &[], vec![])).build();
    let driver = fx.driver(&graph, targets(&["Missing"]), "job-1");
    assert!(matches!(driver.run().unwrap_err(), BuildError::UnknownTarget(_)));
}

#[test]
fn binding_errors_carry_script_locations() {
    let fx = Fixture::new();
    let graph = GraphBuilder::new()
        .agent("Agent")
        .node(node("Broken", &[], &[], vec![task("Copy", &[("To", "out")], 42)]))
        .build();
    let driver = fx.driver(&graph, targets(&["Broken"]), "job-1");
    let err = driver.run().unwrap_err();
    let BuildError::MissingParameter { location, parameter, .. } = err else {
        panic!("wrong error: {err}")
    };
    assert_eq!(location, "job.xml(42)");
    assert_eq!(parameter, "Files");
}

#[test]
fn consuming_an_undeclared_tag_is_reported_at_the_task() {
    let fx = Fixture::new();
    fx.write("src/foo.bin", "artifact");
    let graph = GraphBuilder::new()
        .agent("Agent")
        .node(node("Produce", &[], &["#Artifacts"], vec![]))
        .node(node(
            "Sneaky",
            &[],
            &[],
            // consumes #Artifacts without declaring it as an input
            vec![task("Copy", &[("Files", "#Artifacts"), ("To", "staged")], 17)],
        ))
        .build();
    let driver = fx.driver(&graph, targets(&["Sneaky"]), "job-1");
    let err = driver.run().unwrap_err();
    let BuildError::UnresolvedTag { tag, location } = err else { panic!("wrong error: {err}") };
    assert_eq!(tag, "#Artifacts");
    assert_eq!(location, "job.xml(17)");
}

#[test]
fn storage_blocks_read_back_what_a_node_published(){
    // the block written for Produce round-trips through retrieve + stage on
    // a content level, not just file names
    let fx = Fixture::new();
    fx.write("src/foo.bin", "artifact payload");
    let graph = GraphBuilder::new()
        .agent("Agent")
        .node(node(
            "Produce",
            &[],
            &["#Artifacts"],
            vec![task("Copy", &[("Files", "src/foo.bin"), ("To", "out"), ("Tag", "#Artifacts")], 3)],
        ))
        .build();
    fx.driver(&graph, targets(&["Produce"]), "job-1").run().unwrap();

    let storage = fx.storage();
    let list = storage.read_file_list("Produce", "#Artifacts").unwrap();
    let manifest = storage.retrieve(&list.blocks[0]).unwrap();
    assert_eq!(manifest.files.len(), 1);
    assert_eq!(manifest.files[0].relative_path, "out/foo.bin");
    assert_eq!(manifest.files[0].size, "artifact payload".len() as u64);

    fs::remove_file(fx.root.join("out/foo.bin")).unwrap();
    storage.stage(&list.blocks[0], &manifest).unwrap();
    assert_eq!(fs::read_to_string(fx.root.join("out/foo.bin")).unwrap(), "artifact payload");
}
