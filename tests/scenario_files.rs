//! Loading scenario files from disk and running them end to end

use std::io::Write;
use std::sync::Arc;

use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;

use devalloc::cli::{allocate_on_nodes, format_outcomes, select_nodes, NodeOutcome, OutputFormat};
use devalloc::config::{load_scenario_file, ConfigError, ScenarioError};
use devalloc::SelectorCache;

fn write_scenario(suffix: &str, content: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

const CLUSTER: &str = r#"
settings:
  maxDevicesPerClaim: 8
classes:
  - metadata: {name: gpu}
    spec:
      selectors:
        - cel: {expression: 'device.driver == "gpu.example.com"'}
      config:
        - opaque:
            driver: gpu.example.com
            parameters: {sharing: exclusive}
claims:
  - metadata: {name: training, namespace: ml}
    spec:
      devices:
        requests:
          - name: gpus
            deviceClassName: gpu
            count: 2
            selectors:
              - cel: {expression: 'device.capacity["memory"] >= quantity("40Gi")'}
allocatedDevices:
  - gpu.example.com/worker-1/gpu-1
slices:
  - driver: gpu.example.com
    pool: {name: worker-1}
    nodeName: worker-1
    devices:
      - {name: gpu-0, basic: {capacity: {memory: 80Gi}}}
      - {name: gpu-1, basic: {capacity: {memory: 80Gi}}}
      - {name: gpu-2, basic: {capacity: {memory: 80Gi}}}
  - driver: gpu.example.com
    pool: {name: worker-2}
    nodeName: worker-2
    devices:
      - {name: gpu-0, basic: {capacity: {memory: 80Gi}}}
      - {name: gpu-1, basic: {capacity: {memory: 16Gi}}}
nodes:
  - metadata: {name: worker-1}
  - metadata: {name: worker-2}
"#;

#[test]
fn test_yaml_scenario_end_to_end() {
    let file = write_scenario(".yaml", CLUSTER);
    let scenario = load_scenario_file(file.path()).unwrap();
    assert_eq!(scenario.settings.max_devices_per_claim, 8);

    let allocator = scenario.allocator(Arc::new(SelectorCache::default())).unwrap();
    assert_eq!(allocator.config().max_devices_per_claim, 8);
    let nodes = select_nodes(&scenario, &[]).unwrap();
    let reports = allocate_on_nodes(&allocator, &nodes, &CancellationToken::new());

    // worker-1: gpu-1 is taken, gpu-0 and gpu-2 remain
    let NodeOutcome::Allocated { results } = &reports[0].outcome else {
        panic!("worker-1 should be schedulable: {:?}", reports[0].outcome);
    };
    let ids: Vec<String> = results[0].device_ids().iter().map(|id| id.to_string()).collect();
    assert_eq!(
        ids,
        vec!["gpu.example.com/worker-1/gpu-0", "gpu.example.com/worker-1/gpu-2"]
    );
    assert_eq!(results[0].devices.config.len(), 1);

    // worker-2: only one device has enough memory
    assert_eq!(reports[1].outcome, NodeOutcome::Unschedulable);

    let yaml = format_outcomes(&reports, OutputFormat::Yaml).unwrap();
    assert!(yaml.contains("outcome: unschedulable"));
}

#[test]
fn test_jsonc_scenario_with_invalid_reference() {
    let content = r#"{
        "claims": [{
            "metadata": {"name": "c"},
            "spec": {"devices": {
                "requests": [{"name": "a", "deviceClassName": "gpu"}],
                // "b" does not exist
                "config": [{"requests": ["b"], "opaque": {"driver": "gpu.example.com"}}]
            }}
        }]
    }"#;
    let file = write_scenario(".jsonc", content);

    let err = load_scenario_file(file.path()).unwrap_err();
    assert!(matches!(
        err,
        ConfigError::ScenarioError(ScenarioError::UnknownRequest { context: "config", .. })
    ));
}

#[test]
fn test_errors_are_reported_per_node() {
    let content = r#"{
        "claims": [{
            "metadata": {"name": "c"},
            "spec": {"devices": {"requests": [{"name": "a", "deviceClassName": "missing"}]}}
        }],
        "nodes": [{"metadata": {"name": "worker-1"}}]
    }"#;
    let file = write_scenario(".json", content);
    let scenario = load_scenario_file(file.path()).unwrap();
    let allocator = scenario.allocator(Arc::new(SelectorCache::default())).unwrap();
    let nodes = select_nodes(&scenario, &["worker-1".to_string()]).unwrap();

    let reports = allocate_on_nodes(&allocator, &nodes, &CancellationToken::new());
    let NodeOutcome::Error { message } = &reports[0].outcome else {
        panic!("expected an error: {:?}", reports[0].outcome);
    };
    assert!(message.contains("missing"));

    let json = format_outcomes(&reports, OutputFormat::Json).unwrap();
    assert!(json.contains(r#""outcome": "error""#));
}
