#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

/// Relative path -> file contents (`None` for directories).
pub fn snapshot(root: &Path) -> BTreeMap<String, Option<Vec<u8>>> {
    WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .map(|entry| {
            let entry = entry.unwrap();
            let name = entry
                .path()
                .strip_prefix(root)
                .unwrap()
                .components()
                .map(|c| c.as_os_str().to_str().unwrap().to_string())
                .collect::<Vec<_>>()
                .join("/");
            let contents = entry
                .file_type()
                .is_file()
                .then(|| fs::read(entry.path()).unwrap());
            (name, contents)
        })
        .collect()
}

/// A small tree with nesting, an empty directory and binary data.
pub fn sample_tree(root: &Path) {
    fs::create_dir_all(root.join("docs/guides")).unwrap();
    fs::create_dir_all(root.join("empty")).unwrap();
    fs::write(root.join("file.txt"), "this is a text file").unwrap();
    fs::write(root.join("docs/readme.md"), "# readme\n".repeat(50)).unwrap();
    fs::write(root.join("docs/guides/intro.txt"), "intro").unwrap();
    fs::write(root.join("docs/empty.bin"), b"").unwrap();
    let binary: Vec<u8> = (0..20_000u32).map(|i| (i * 7919 % 251) as u8).collect();
    fs::write(root.join("data.bin"), binary).unwrap();
}
