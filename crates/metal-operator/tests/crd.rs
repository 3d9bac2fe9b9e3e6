use metal_operator::crd::write_crds;

#[test]
fn crds_are_written_as_separate_documents() {
    let mut buffer = Vec::new();
    write_crds(&mut buffer).expect("CRDs are serializable");
    let output = String::from_utf8(buffer).expect("YAML is UTF-8");

    let documents: Vec<serde_yaml::Value> = output
        .split("---\n")
        .filter(|document| !document.trim().is_empty())
        .map(|document| serde_yaml::from_str(document).expect("document is valid YAML"))
        .collect();

    let names: Vec<&str> = documents
        .iter()
        .filter_map(|document| document["metadata"]["name"].as_str())
        .collect();
    assert_eq!(
        names,
        [
            "metalclusters.infrastructure.cluster.x-k8s.io",
            "metalmachines.infrastructure.cluster.x-k8s.io"
        ]
    );
    for document in &documents {
        assert_eq!(document["kind"].as_str(), Some("CustomResourceDefinition"));
        assert_eq!(
            document["spec"]["versions"][0]["subresources"]["status"],
            serde_yaml::Value::Mapping(serde_yaml::Mapping::new())
        );
    }
}
