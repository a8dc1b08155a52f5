use std::collections::BTreeSet;
use std::fs;

use certflow_acme::{
    build_csr, ensure_account_key, ensure_certificate_key, group_domains_by_registrable_domain,
    parse_csr_domains, StorageLayout,
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

#[test]
fn keys_are_loaded_not_regenerated() {
    let dir = TempDir::new().expect("tempdir");
    let layout = StorageLayout::new(dir.path());
    let group = group_domains_by_registrable_domain(["*.example.com", "example.com"])
        .pop()
        .expect("one group");

    let account_path = layout.account_key_path();
    let account = ensure_account_key(&account_path).expect("account key");
    let account_pem = fs::read(&account_path).expect("read account key");
    let reloaded = ensure_account_key(&account_path).expect("reload account key");
    assert_eq!(account.jwk_thumbprint(), reloaded.jwk_thumbprint());
    assert_eq!(fs::read(&account_path).expect("read again"), account_pem);

    let key_path = layout.certificate_key_path(&group);
    assert!(key_path.ends_with("_.example.com.key"));
    let key = ensure_certificate_key(&key_path).expect("certificate key");
    let key_pem = fs::read(&key_path).expect("read key");
    let again = ensure_certificate_key(&key_path).expect("reload certificate key");
    assert_eq!(key.pem().trim(), again.pem().trim());
    assert_eq!(fs::read(&key_path).expect("read key again"), key_pem);
}

#[test]
fn csr_carries_the_whole_group() {
    let dir = TempDir::new().expect("tempdir");
    let layout = StorageLayout::new(dir.path());
    let groups = group_domains_by_registrable_domain([
        "example.com",
        "*.example.com",
        "api.example.com",
    ]);
    assert_eq!(groups.len(), 1);
    let group = &groups[0];

    let key = ensure_certificate_key(&layout.certificate_key_path(group)).expect("key");
    let csr = build_csr(group.domains(), &key).expect("csr");
    let parsed = parse_csr_domains(&csr.pem).expect("parse csr");

    assert_eq!(parsed.common_name.as_deref(), Some("example.com"));
    let expected: BTreeSet<&str> = group.domains().iter().map(String::as_str).collect();
    let found: BTreeSet<&str> = parsed
        .subject_alt_names
        .iter()
        .map(String::as_str)
        .collect();
    assert_eq!(found, expected);
}
