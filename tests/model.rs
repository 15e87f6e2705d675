// tests/model.rs

mod common;
use crate::common::builders::{ManifestBuilder, digest_of, layer};

use ducc::collab::{MemoryStore, Store, filter_tags};
use ducc::model::{Chain, ImageRef, Manifest, WishSpec, digest_hex};

#[test]
fn image_ref_parses_registry_repository_and_tag() {
    let image = ImageRef::parse("https://registry.example.org/library/ubuntu:22.04").unwrap();

    assert_eq!(image.scheme, "https");
    assert_eq!(image.registry, "registry.example.org");
    assert_eq!(image.repository, "library/ubuntu");
    assert_eq!(image.tag.as_deref(), Some("22.04"));
    assert_eq!(image.digest, None);
    assert_eq!(image.repository_key(), "registry.example.org/library/ubuntu");
    assert_eq!(image.simple_name(), "library/ubuntu:22.04");
    assert!(!image.is_wildcard());
}

#[test]
fn image_ref_defaults_scheme_and_tag() {
    let image: ImageRef = "localhost:5000/tools/app".parse().unwrap();

    assert_eq!(image.scheme, "https");
    assert_eq!(image.registry, "localhost:5000");
    assert_eq!(image.tag.as_deref(), Some("latest"));
    assert_eq!(image.to_string(), "https://localhost:5000/tools/app:latest");
}

#[test]
fn image_ref_digest_takes_precedence() {
    let digest = digest_of("pinned");
    let image = ImageRef::parse(&format!("http://registry.example.org/app@{digest}")).unwrap();

    assert_eq!(image.scheme, "http");
    assert_eq!(image.tag, None);
    assert_eq!(image.digest.as_deref(), Some(digest.as_str()));
    assert_eq!(image.simple_name(), format!("app@{digest}"));
    assert!(!image.is_wildcard());
    assert_eq!(ImageRef::parse(&image.to_string()).unwrap(), image);
}

#[test]
fn image_ref_rejects_malformed_input() {
    for input in [
        "ubuntu",
        "registry.example.org",
        "registry.example.org/",
        "ftp://registry.example.org/library/ubuntu",
        "registry.example.org/app@sha256:abc",
    ] {
        assert!(ImageRef::parse(input).is_err(), "{input} should be rejected");
    }
}

#[test]
fn wildcard_tags_are_detected_and_replaced() {
    let image = ImageRef::parse("registry.example.org/library/ubuntu:2[02].*").unwrap();
    assert!(image.is_wildcard());

    let concrete = image.with_tag("22.04");
    assert!(!concrete.is_wildcard());
    assert_eq!(concrete.repository, image.repository);
    assert_eq!(concrete.tag.as_deref(), Some("22.04"));
}

#[test]
fn filter_tags_matches_globs_sorted_and_deduplicated() {
    let tags = ["22.04", "20.04", "latest", "22.04", "18.04"];

    assert_eq!(filter_tags(tags, "2*").unwrap(), vec!["20.04", "22.04"]);
    assert_eq!(filter_tags(tags, "latest").unwrap(), vec!["latest"]);
    assert!(filter_tags(tags, "9*").unwrap().is_empty());
    assert!(filter_tags(tags, "[").is_err());
}

#[test]
fn chain_ids_start_at_the_first_diff_id_and_chain_onwards() {
    let manifest = ManifestBuilder::new("cfg").layers(&["a", "b", "c"]).build();
    let chain = Chain::from_manifest(&manifest);

    assert_eq!(chain.len(), 3);
    assert_eq!(chain.links[0].chain_id, layer("a").diff_id.unwrap());
    assert_eq!(chain.links[0].parent, None);
    for pair in chain.links.windows(2) {
        assert_eq!(pair[1].parent.as_deref(), Some(pair[0].chain_id.as_str()));
        assert!(pair[1].chain_id.starts_with("blake3:"));
    }
    assert_eq!(chain.top(), Some(chain.links[2].chain_id.as_str()));
}

#[test]
fn chains_share_exactly_their_common_prefix() {
    let left = Chain::from_manifest(&ManifestBuilder::new("l").layers(&["a", "b", "x"]).build());
    let right = Chain::from_manifest(&ManifestBuilder::new("r").layers(&["a", "b", "y"]).build());
    let reordered = Chain::from_manifest(&ManifestBuilder::new("o").layers(&["b", "a"]).build());

    assert_eq!(left.links[..2], right.links[..2]);
    assert_ne!(left.top(), right.top());
    assert_ne!(reordered.links[1].chain_id, left.links[1].chain_id);
}

#[test]
fn foreign_layers_are_left_out_of_the_chain() {
    let with_foreign = ManifestBuilder::new("cfg")
        .foreign_layer("windows-base")
        .layers(&["a", "b"])
        .build();
    let plain = ManifestBuilder::new("cfg").layers(&["a", "b"]).build();

    let chain = Chain::from_manifest(&with_foreign);
    assert_eq!(chain.len(), 2);
    assert_eq!(chain, Chain::from_manifest(&plain));
    assert!(Chain::from_manifest(&ManifestBuilder::new("e").build()).is_empty());
}

#[test]
fn missing_diff_id_falls_back_to_the_compressed_digest() {
    let mut manifest = ManifestBuilder::new("cfg").layer("a").build();
    manifest.layers[0].diff_id = None;

    let chain = Chain::from_manifest(&manifest);
    assert_eq!(chain.links[0].chain_id, layer("a").digest);
}

#[test]
fn manifest_json_uses_registry_field_names() {
    let json = format!(
        r#"{{
            "schemaVersion": 2,
            "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
            "config": {{"mediaType": "application/vnd.docker.container.image.v1+json", "digest": "{}", "size": 7}},
            "layers": [{{"mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip", "digest": "{}", "size": 3}}]
        }}"#,
        digest_of("config"),
        digest_of("layer"),
    );

    let manifest: Manifest = serde_json::from_str(&json).unwrap();
    assert_eq!(manifest.schema_version, 2);
    assert_eq!(manifest.layers.len(), 1);
    assert_eq!(manifest.layers[0].diff_id(), digest_of("layer"));
    assert_eq!(digest_hex(&manifest.config.digest).len(), 64);
}

#[test]
fn memory_store_upserts_wishes_and_images_idempotently() {
    let store = MemoryStore::new();
    let spec = WishSpec::parse("unpacked.example.org", "registry.example.org/library/alpine").unwrap();

    let first = store.upsert_wish(spec.clone()).unwrap();
    let again = store.upsert_wish(spec).unwrap();
    assert_eq!(first, again);
    assert_eq!(first.id, 1);
    assert_eq!(store.wishes().unwrap().len(), 1);

    let image = first.input.with_tag("3.20");
    let record = store.upsert_image(&image).unwrap();
    assert_eq!(store.upsert_image(&image).unwrap(), record);

    store.link_image(first.id, record.id).unwrap();
    store.link_image(first.id, record.id).unwrap();
    assert_eq!(store.images_for_wish(first.id).unwrap(), vec![record.clone()]);

    store.unlink_image(first.id, record.id).unwrap();
    assert!(store.images_for_wish(first.id).unwrap().is_empty());
    assert!(store.link_image(99, record.id).is_err());
    assert!(store.set_manifest(99, &ManifestBuilder::new("x").build()).is_err());
}
