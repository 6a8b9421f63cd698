use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

use labsync_core::{
    EnsureName, Error, FileSystem, FolderCatalog, FolderScheme, FolderTree, IdentityKey,
    IdentitySpec, LevelPatterns, LocalFs,
};

fn patterns() -> LevelPatterns {
    let mut sources = BTreeMap::new();
    sources.insert("year".to_string(), r"(?P<year>[0-9]{4})".to_string());
    sources.insert(
        "experiment".to_string(),
        r"(?P<expid>RS[0-9]{3})[_ ]+(?P<exp_titledesc>.+)".to_string(),
    );
    sources.insert(
        "subentry".to_string(),
        r"(?P<expid>RS[0-9]{3})-?(?P<subentry_idx>[^_ ])[_ ]+(?P<subentry_titledesc>.+)".to_string(),
    );
    LevelPatterns::compile(&sources).unwrap()
}

fn tree(root: &Path) -> FolderTree {
    let fs: Arc<dyn FileSystem> = Arc::new(LocalFs::new(root));
    FolderTree {
        fs,
        scheme: FolderScheme::parse("./year/experiment/subentry"),
        patterns: patterns(),
        ignore_dirs: Vec::new(),
    }
}

/// root/
///   2023/RS090 Older/RS090a Only
///   2024/RS100 Title/RS100a Sub
///   2024/RS100 Title/RS100b Other
///   2024/RS101 Second/RS101a Alone
fn create_tree(root: &Path) {
    for dir in [
        "2023/RS090 Older/RS090a Only",
        "2024/RS100 Title/RS100a Sub",
        "2024/RS100 Title/RS100b Other",
        "2024/RS101 Second/RS101a Alone",
    ] {
        fs::create_dir_all(root.join(dir)).unwrap();
    }
}

fn key(fields: &[&str]) -> IdentityKey {
    IdentityKey::new(fields.iter().copied())
}

#[test]
fn test_indices_are_consistent() {
    let tmp = tempdir().unwrap();
    create_tree(tmp.path());

    for spec in [IdentitySpec::experiment(), IdentitySpec::subentry()] {
        let catalog = FolderCatalog::build(tree(tmp.path()), spec).unwrap();
        assert!(!catalog.is_empty());
        for (identity, path) in catalog.iter() {
            assert_eq!(catalog.identity_of(path), Some(identity));
            assert_eq!(catalog.get_by_identity(identity), Some(path));
            assert!(catalog.contains_path(path));
        }
        assert!(catalog.collisions().is_empty());
    }

    let subentries = FolderCatalog::build(tree(tmp.path()), IdentitySpec::subentry()).unwrap();
    assert_eq!(subentries.len(), 4);
    assert_eq!(
        subentries.get_by_identity(&key(&["RS100", "b"])),
        Some(tmp.path().join("2024/RS100 Title/RS100b Other").as_path())
    );
}

#[test]
fn test_nested_view() {
    let tmp = tempdir().unwrap();
    create_tree(tmp.path());
    let catalog = FolderCatalog::build(tree(tmp.path()), IdentitySpec::subentry()).unwrap();

    let nested = catalog.nested();
    assert_eq!(nested.len(), 3);
    assert_eq!(nested["RS100"].len(), 2);
    assert_eq!(nested["RS100"]["a"], tmp.path().join("2024/RS100 Title/RS100a Sub"));
}

#[test]
fn test_rename_keeps_indices_consistent() {
    let tmp = tempdir().unwrap();
    create_tree(tmp.path());
    let mut catalog = FolderCatalog::build(tree(tmp.path()), IdentitySpec::experiment()).unwrap();
    let size = catalog.len();

    let old = tmp.path().join("2024/RS100 Title");
    let new = catalog.rename_path(&old, "RS100 Better title").unwrap();

    assert_eq!(new, tmp.path().join("2024/RS100 Better title"));
    assert!(new.is_dir());
    assert!(!old.exists());
    assert_eq!(catalog.len(), size);
    assert!(catalog.identity_of(&old).is_none());
    assert!(!catalog.contains_path(&old));
    assert_eq!(catalog.identity_of(&new), Some(&key(&["RS100"])));
    assert_eq!(catalog.get_by_identity(&key(&["RS100"])), Some(new.as_path()));
}

#[test]
fn test_rename_to_other_parent_is_rejected() {
    let tmp = tempdir().unwrap();
    create_tree(tmp.path());
    let mut catalog = FolderCatalog::build(tree(tmp.path()), IdentitySpec::experiment()).unwrap();
    let old = tmp.path().join("2024/RS100 Title");

    let moved = tmp.path().join("2023/RS100 Title");
    let result = catalog.rename_path(&old, &moved.to_string_lossy());
    assert!(matches!(result, Err(Error::RenameOutsideParent { .. })));

    let result = catalog.rename_path(&old, "elsewhere/RS100 Title");
    assert!(matches!(result, Err(Error::RenameOutsideParent { .. })));

    assert!(old.is_dir());
    assert_eq!(catalog.get_by_identity(&key(&["RS100"])), Some(old.as_path()));
    assert_eq!(catalog.identity_of(&old), Some(&key(&["RS100"])));
}

#[test]
fn test_rename_with_full_path_in_same_parent() {
    let tmp = tempdir().unwrap();
    create_tree(tmp.path());
    let mut catalog = FolderCatalog::build(tree(tmp.path()), IdentitySpec::experiment()).unwrap();

    let target = tmp.path().join("2024/RS100 Renamed");
    let new = catalog
        .rename_path(&tmp.path().join("2024/RS100 Title"), &target.to_string_lossy())
        .unwrap();
    assert_eq!(new, target);
}

#[test]
fn test_failed_rename_leaves_catalog_unchanged() {
    let tmp = tempdir().unwrap();
    create_tree(tmp.path());
    fs::create_dir_all(tmp.path().join("2024/Taken")).unwrap();
    let mut catalog = FolderCatalog::build(tree(tmp.path()), IdentitySpec::experiment()).unwrap();
    let old = tmp.path().join("2024/RS100 Title");

    let result = catalog.rename_path(&old, "Taken");
    assert!(matches!(result, Err(Error::Rename { .. })));
    assert!(old.is_dir());
    assert_eq!(catalog.get_by_identity(&key(&["RS100"])), Some(old.as_path()));

    let result = catalog.rename_path(&tmp.path().join("2024/Not cataloged"), "Whatever");
    assert!(matches!(result, Err(Error::NotInCatalog(_))));
}

#[test]
fn test_duplicates_by_min_count() {
    let tmp = tempdir().unwrap();
    create_tree(tmp.path());
    fs::create_dir_all(tmp.path().join("2024/RS100 Title/RS100a Copy")).unwrap();
    let catalog = FolderCatalog::build(tree(tmp.path()), IdentitySpec::subentry()).unwrap();

    let dups = catalog.duplicates(&IdentitySpec::subentry(), 2).unwrap();
    assert_eq!(dups.len(), 1);
    assert_eq!(
        dups[&key(&["RS100", "a"])],
        vec![
            tmp.path().join("2024/RS100 Title/RS100a Copy"),
            tmp.path().join("2024/RS100 Title/RS100a Sub"),
        ]
    );

    let all = catalog.duplicates(&IdentitySpec::subentry(), 1).unwrap();
    assert_eq!(all.len(), 4);
    assert_eq!(all[&key(&["RS090", "a"])].len(), 1);
}

#[test]
fn test_duplicate_experiments() {
    let tmp = tempdir().unwrap();
    fs::create_dir_all(tmp.path().join("2024/RS100 A")).unwrap();
    fs::create_dir_all(tmp.path().join("2024/RS100 Adup")).unwrap();
    fs::create_dir_all(tmp.path().join("2024/RS101 B")).unwrap();
    let tree = tree(tmp.path());

    let dups = tree
        .folders_with_same_property(&IdentitySpec::experiment(), 2)
        .unwrap();
    let mut expected = BTreeMap::new();
    expected.insert(
        key(&["RS100"]),
        vec![tmp.path().join("2024/RS100 A"), tmp.path().join("2024/RS100 Adup")],
    );
    assert_eq!(dups, expected);
}

#[test]
fn test_collisions_keep_first_path() {
    let tmp = tempdir().unwrap();
    fs::create_dir_all(tmp.path().join("2024/RS100 A")).unwrap();
    fs::create_dir_all(tmp.path().join("2024/RS100 Adup")).unwrap();
    let mut catalog = FolderCatalog::build(tree(tmp.path()), IdentitySpec::experiment()).unwrap();

    assert_eq!(catalog.len(), 1);
    assert_eq!(
        catalog.get_by_identity(&key(&["RS100"])),
        Some(tmp.path().join("2024/RS100 A").as_path())
    );
    assert_eq!(
        catalog.collisions(),
        &[(key(&["RS100"]), tmp.path().join("2024/RS100 Adup"))]
    );

    // The shadowed folder can still be renamed; the indices keep pointing at
    // the first one.
    let renamed = catalog
        .rename_path(&tmp.path().join("2024/RS100 Adup"), "RS100 B-side")
        .unwrap();
    assert!(renamed.is_dir());
    assert_eq!(catalog.collisions()[0].1, renamed);
    assert_eq!(
        catalog.get_by_identity(&key(&["RS100"])),
        Some(tmp.path().join("2024/RS100 A").as_path())
    );
}

#[test]
fn test_entries_without_identity_fields_are_skipped() {
    let tmp = tempdir().unwrap();
    create_tree(tmp.path());
    let spec = IdentitySpec::new("experiment", ["expid", "no_such_group"]);
    let catalog = FolderCatalog::build(tree(tmp.path()), spec).unwrap();
    assert!(catalog.is_empty());
}

#[test]
fn test_diff_against_previous_build() {
    let tmp = tempdir().unwrap();
    create_tree(tmp.path());
    let mut catalog = FolderCatalog::build(tree(tmp.path()), IdentitySpec::subentry()).unwrap();

    let initial = catalog.diff_against_previous();
    assert_eq!(initial.added_paths.len(), 4);
    assert!(initial.removed_paths.is_empty());

    fs::create_dir_all(tmp.path().join("2024/RS101 Second/RS101b New")).unwrap();
    fs::remove_dir_all(tmp.path().join("2023")).unwrap();

    // Nothing changes until the catalog is rebuilt.
    assert_eq!(catalog.diff_against_previous(), initial);

    catalog.rebuild().unwrap();
    let diff = catalog.diff_against_previous();
    let added: Vec<PathBuf> = diff.added_paths.into_iter().collect();
    let removed: Vec<PathBuf> = diff.removed_paths.into_iter().collect();
    assert_eq!(added, vec![tmp.path().join("2024/RS101 Second/RS101b New")]);
    assert_eq!(removed, vec![tmp.path().join("2023/RS090 Older/RS090a Only")]);
    assert_eq!(
        diff.added_identities.into_iter().collect::<Vec<_>>(),
        vec![key(&["RS101", "b"])]
    );
}

#[test]
fn test_rebuild_if_stale() {
    let tmp = tempdir().unwrap();
    create_tree(tmp.path());
    let mut catalog = FolderCatalog::build(tree(tmp.path()), IdentitySpec::experiment()).unwrap();
    let first = catalog.built_at().unwrap();

    assert!(catalog.is_fresh(Duration::from_secs(3600)));
    assert!(!catalog.rebuild_if_stale(Duration::from_secs(3600)).unwrap());
    assert_eq!(catalog.built_at(), Some(first));

    assert!(catalog.rebuild_if_stale(Duration::ZERO).unwrap());
    assert!(catalog.built_at().unwrap() >= first);
}

#[test]
fn test_ensure_name() {
    let tmp = tempdir().unwrap();
    create_tree(tmp.path());
    fs::create_dir_all(tmp.path().join("2024/RS101 Second/Taken")).unwrap();
    let mut catalog = FolderCatalog::build(tree(tmp.path()), IdentitySpec::subentry()).unwrap();

    assert_eq!(
        catalog.ensure_name(&key(&["RS100", "a"]), "RS100a Sub"),
        EnsureName::AlreadyNamed
    );
    assert_eq!(
        catalog.ensure_name(&key(&["RS999", "a"]), "RS999a Nope"),
        EnsureName::NotCataloged
    );
    assert_eq!(
        catalog.ensure_name(&key(&["RS100", "a"]), "RS100a Subentry"),
        EnsureName::Renamed(tmp.path().join("2024/RS100 Title/RS100a Subentry"))
    );
    assert!(matches!(
        catalog.ensure_name(&key(&["RS101", "a"]), "Taken"),
        EnsureName::Failed(_)
    ));
    assert_eq!(
        catalog.get_by_identity(&key(&["RS101", "a"])),
        Some(tmp.path().join("2024/RS101 Second/RS101a Alone").as_path())
    );
}
