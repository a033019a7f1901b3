//! Tests for volume translation.
//!
//! Validates host path handling, secret and config map resolution with
//! optional sources, projections and unsupported volume types.

use fledge::error::Error;
use fledge::pod::{
    HostPathType, KeyToPath, ObjectSource, ProjectionSource, Volume, VolumeSource,
};
use fledge::resources::{ConfigMap, Secret, StaticResources};
use fledge::volume::{ResolvedSource, VolumeTranslator};
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;

fn resources() -> Arc<StaticResources> {
    let resources = StaticResources::new();
    resources
        .insert_secret(Secret {
            name: "creds".to_string(),
            namespace: "default".to_string(),
            data: BTreeMap::from([
                ("token".to_string(), b"s3cr3t".to_vec()),
                ("user".to_string(), b"admin".to_vec()),
            ]),
        })
        .unwrap();
    resources
        .insert_config_map(ConfigMap {
            name: "settings".to_string(),
            namespace: "default".to_string(),
            data: BTreeMap::from([("app.conf".to_string(), "debug=true".to_string())]),
        })
        .unwrap();
    Arc::new(resources)
}

fn object(name: &str, optional: Option<bool>) -> ObjectSource {
    ObjectSource {
        name: name.to_string(),
        optional,
        items: Vec::new(),
    }
}

fn volume(name: &str, source: VolumeSource) -> Volume {
    Volume {
        name: name.to_string(),
        source,
    }
}

// =============================================================================
// Host Path Tests
// =============================================================================

#[tokio::test]
async fn test_host_path_directory_or_create() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("data").join("nested");
    let translator = VolumeTranslator::new(resources());

    let resolved = translator
        .translate(
            "default",
            &volume(
                "data",
                VolumeSource::HostPath {
                    path: path.display().to_string(),
                    kind: HostPathType::DirectoryOrCreate,
                },
            ),
        )
        .await
        .unwrap();

    assert!(path.is_dir());
    assert_eq!(resolved.source, ResolvedSource::HostPath { path: path.clone() });
    assert_eq!(resolved.materialize(temp.path()).unwrap(), Some(path));
}

#[tokio::test]
async fn test_host_path_unsupported_type() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("run").join("app.sock");
    let translator = VolumeTranslator::new(resources());

    let err = translator
        .translate(
            "default",
            &volume(
                "sock",
                VolumeSource::HostPath {
                    path: path.display().to_string(),
                    kind: HostPathType::Other("Socket".to_string()),
                },
            ),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::UnsupportedVolumeType { .. }));
    assert!(!path.exists(), "nothing is created for rejected types");
    assert!(!temp.path().join("run").exists());
}

#[tokio::test]
async fn test_unsupported_volume_types() {
    let translator = VolumeTranslator::new(resources());

    for source in [
        VolumeSource::EmptyDir,
        VolumeSource::Other {
            kind: "nfs".to_string(),
        },
    ] {
        let err = translator
            .translate("default", &volume("scratch", source))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedVolumeType { .. }), "{err}");
    }
}

// =============================================================================
// Secret and Config Map Tests
// =============================================================================

#[tokio::test]
async fn test_secret_all_keys() {
    let translator = VolumeTranslator::new(resources());
    let resolved = translator
        .translate(
            "default",
            &volume("creds", VolumeSource::Secret(object("creds", None))),
        )
        .await
        .unwrap();

    let ResolvedSource::Files { files, .. } = &resolved.source else {
        panic!("expected files, got {:?}", resolved.source);
    };
    assert_eq!(files.len(), 2);
    assert_eq!(files["token"], b"s3cr3t");
}

#[tokio::test]
async fn test_secret_selected_items_materialize() {
    let temp = TempDir::new().unwrap();
    let translator = VolumeTranslator::new(resources());
    let mut source = object("creds", None);
    source.items = vec![KeyToPath {
        key: "token".to_string(),
        path: "auth/token".to_string(),
    }];

    let resolved = translator
        .translate("default", &volume("creds", VolumeSource::Secret(source)))
        .await
        .unwrap();
    let dir = temp.path().join("creds");
    let mounted = resolved.materialize(&dir).unwrap().unwrap();

    assert_eq!(mounted, dir);
    assert_eq!(std::fs::read(dir.join("auth/token")).unwrap(), b"s3cr3t");
    assert!(!dir.join("user").exists());
}

#[tokio::test]
async fn test_missing_required_secret_fails() {
    let translator = VolumeTranslator::new(resources());

    // Unset `optional` means required.
    let err = translator
        .translate(
            "default",
            &volume("creds", VolumeSource::Secret(object("absent", None))),
        )
        .await
        .unwrap_err();
    match &err {
        Error::MissingRequiredResource { name, volume, .. } => {
            assert_eq!(name, "absent");
            assert_eq!(volume, "creds");
        }
        other => panic!("unexpected error: {other}"),
    }
    let message = err.to_string();
    assert!(message.contains("absent") && message.contains("creds"), "{message}");

    // Objects are looked up in the pod's namespace.
    let err = translator
        .translate(
            "other",
            &volume("creds", VolumeSource::Secret(object("creds", Some(false)))),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MissingRequiredResource { .. }));
}

#[tokio::test]
async fn test_missing_optional_secret_is_empty() {
    let temp = TempDir::new().unwrap();
    let translator = VolumeTranslator::new(resources());

    let resolved = translator
        .translate(
            "default",
            &volume("creds", VolumeSource::Secret(object("absent", Some(true)))),
        )
        .await
        .unwrap();

    assert_eq!(resolved.source, ResolvedSource::Empty);
    assert_eq!(resolved.materialize(&temp.path().join("creds")).unwrap(), None);
    assert!(!temp.path().join("creds").exists());
}

#[tokio::test]
async fn test_missing_optional_config_map_is_empty() {
    let temp = TempDir::new().unwrap();
    let translator = VolumeTranslator::new(resources());

    let resolved = translator
        .translate(
            "default",
            &volume("settings", VolumeSource::ConfigMap(object("absent", Some(true)))),
        )
        .await
        .unwrap();

    assert_eq!(resolved.source, ResolvedSource::Empty);
    assert_eq!(resolved.materialize(temp.path()).unwrap(), None);
}

#[tokio::test]
async fn test_missing_required_key_fails() {
    let translator = VolumeTranslator::new(resources());
    let mut source = object("settings", None);
    source.items = vec![KeyToPath {
        key: "missing.conf".to_string(),
        path: "missing.conf".to_string(),
    }];

    let err = translator
        .translate("default", &volume("settings", VolumeSource::ConfigMap(source)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MissingRequiredResource { .. }));
}

// =============================================================================
// Projection Tests
// =============================================================================

#[tokio::test]
async fn test_projected_merges_and_stubs() {
    let translator = VolumeTranslator::new(resources());
    let resolved = translator
        .translate(
            "default",
            &volume(
                "bundle",
                VolumeSource::Projected {
                    sources: vec![
                        ProjectionSource::Secret(object("creds", None)),
                        ProjectionSource::ConfigMap(object("settings", None)),
                        ProjectionSource::ConfigMap(object("absent", Some(true))),
                        ProjectionSource::ServiceAccountToken,
                    ],
                },
            ),
        )
        .await
        .unwrap();

    let ResolvedSource::Files { files, stubbed } = &resolved.source else {
        panic!("expected files, got {:?}", resolved.source);
    };
    let names: Vec<&str> = files.keys().map(String::as_str).collect();
    assert_eq!(names, vec!["app.conf", "token", "user"]);
    assert_eq!(stubbed, &vec!["serviceAccountToken".to_string()]);
}

#[tokio::test]
async fn test_projected_missing_source_fails() {
    let translator = VolumeTranslator::new(resources());
    let err = translator
        .translate(
            "default",
            &volume(
                "bundle",
                VolumeSource::Projected {
                    sources: vec![ProjectionSource::Secret(object("absent", None))],
                },
            ),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedProjectionSource { .. }));
}
