#![forbid(unsafe_code)]

use h2_block::MemByteDevice;
use h2_core::{H2Error, MountOptions, ObjType, Pfs, Volume, list_pfs};
use h2_harness::{BuildOptions, BuiltImage, FileOptions, ImageBuilder, ZeroBlocks};
use h2_types::{HAMMER2_COMP_LZ4, HAMMER2_COMP_ZLIB, HAMMER2_PBUFSIZE};
use std::collections::BTreeSet;
use std::sync::Arc;

const BLOCK: usize = HAMMER2_PBUFSIZE as usize;

fn volume(img: &BuiltImage) -> Arc<Volume> {
    let dev = Arc::new(MemByteDevice::new(img.bytes.clone()));
    Arc::new(Volume::open(dev, &MountOptions::default()).expect("open volume"))
}

fn mount(img: &BuiltImage) -> Pfs {
    Pfs::mount(volume(img), "ROOT").expect("mount ROOT")
}

/// Compressible but not trivially so.
fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| seed.wrapping_add((i / 7) as u8) ^ ((i % 13) as u8))
        .collect()
}

#[test]
fn readdir_lists_dot_entries_then_children_in_hash_order() {
    let mut b = ImageBuilder::new();
    let root = b.root();
    let docs = b.mkdir(root, "docs");
    let a = b.file(root, "alpha", b"a".to_vec());
    let z = b.file(root, "zulu", vec![3_u8; 4000]);
    let link = b.symlink(root, "latest", "docs/readme");
    let pfs = mount(&b.build());

    let entries = pfs.readdir(pfs.root()).expect("readdir");
    assert_eq!(entries[0].name, ".");
    assert_eq!(entries[1].name, "..");
    assert_eq!(entries[0].inum, pfs.root().inum());

    let names: BTreeSet<&str> = entries[2..].iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, BTreeSet::from(["alpha", "docs", "latest", "zulu"]));
    for pair in entries[2..].windows(2) {
        assert!(pair[0].key < pair[1].key, "keys strictly increase");
    }
    let by_name = |name: &str| entries.iter().find(|e| e.name == name).expect(name).clone();
    assert_eq!(by_name("docs").inum, docs.inum);
    assert_eq!(by_name("docs").kind, ObjType::Directory);
    assert_eq!(by_name("alpha").inum, a.inum);
    assert_eq!(by_name("zulu").kind, ObjType::Regular);
    assert_eq!(by_name("zulu").inum, z.inum);
    assert_eq!(by_name("latest").kind, ObjType::Symlink);
    assert_eq!(by_name("latest").inum, link.inum);
}

#[test]
fn small_file_is_served_from_direct_data() {
    let mut b = ImageBuilder::new();
    let root = b.root();
    b.file(root, "tiny", b"hello, hammer2\n".to_vec());
    let pfs = mount(&b.build());

    let ip = pfs.resolve_path("/tiny").expect("resolve");
    let st = pfs.stat(&ip);
    assert!(st.direct_data);
    assert_eq!(st.size, 15);
    assert_eq!(pfs.read_all(&ip).expect("read"), b"hello, hammer2\n");

    let mut buf = [0_u8; 8];
    assert_eq!(pfs.read(&ip, 7, &mut buf).expect("read"), 8);
    assert_eq!(&buf, b"hammer2\n");
}

#[test]
fn compressed_multi_block_files_read_back() {
    for comp in [HAMMER2_COMP_LZ4, HAMMER2_COMP_ZLIB] {
        let mut b = ImageBuilder::new();
        let root = b.root();
        let data = pattern(3 * BLOCK + 1234, comp);
        b.file_with(
            root,
            "packed",
            data.clone(),
            FileOptions {
                comp: Some(comp),
                ..FileOptions::default()
            },
        );
        let pfs = mount(&b.build());
        let ip = pfs.resolve_path("packed").expect("resolve");
        assert_eq!(pfs.stat(&ip).size, data.len() as u64);
        assert_eq!(pfs.read_all(&ip).expect("read"), data, "comp {comp}");

        // A read straddling the first block boundary.
        let mut buf = vec![0_u8; 200];
        let got = pfs.read(&ip, BLOCK as u64 - 100, &mut buf).expect("read");
        assert_eq!(got, 200);
        assert_eq!(buf, data[BLOCK - 100..BLOCK + 100]);
    }
}

#[test]
fn holes_and_autozero_blocks_read_as_zeros() {
    let mut data = vec![1_u8; BLOCK];
    data.extend(vec![0_u8; 2 * BLOCK]);
    data.extend(vec![2_u8; BLOCK / 2]);

    for zeros in [ZeroBlocks::Hole, ZeroBlocks::Autozero, ZeroBlocks::Store] {
        let mut b = ImageBuilder::new();
        let root = b.root();
        let node = b.file_with(
            root,
            "sparse",
            data.clone(),
            FileOptions {
                zero_blocks: Some(zeros),
                ..FileOptions::default()
            },
        );
        let img = b.build();
        let stored = img.data_blocks(node).len();
        match zeros {
            ZeroBlocks::Store => assert_eq!(stored, 4),
            ZeroBlocks::Hole | ZeroBlocks::Autozero => assert_eq!(stored, 2),
        }
        let pfs = mount(&img);
        let ip = pfs.resolve_path("sparse").expect("resolve");
        assert_eq!(pfs.read_all(&ip).expect("read"), data, "{zeros:?}");
    }
}

#[test]
fn reads_are_capped_at_file_size() {
    let mut b = ImageBuilder::new();
    let root = b.root();
    b.file(root, "f", vec![9_u8; 3000]);
    let pfs = mount(&b.build());
    let ip = pfs.resolve_path("f").expect("resolve");

    let mut buf = vec![0xAA_u8; 5000];
    assert_eq!(pfs.read(&ip, 0, &mut buf).expect("read"), 3000);
    assert!(buf[..3000].iter().all(|b| *b == 9));
    assert_eq!(pfs.read(&ip, 2990, &mut buf).expect("read"), 10);
    assert_eq!(pfs.read(&ip, 3000, &mut buf).expect("read"), 0);
    assert_eq!(pfs.read(&ip, 1 << 40, &mut buf).expect("read"), 0);
}

#[test]
fn large_file_spans_indirect_blocks() {
    let opts = BuildOptions {
        fanout: 8,
        ..BuildOptions::default()
    };
    let mut b = ImageBuilder::with_options(opts);
    let root = b.root();
    let data = pattern(20 * BLOCK + 17, 5);
    b.file(root, "big", data.clone());
    let img = b.build();
    assert!(!img.indirect_blocks().is_empty());

    let pfs = mount(&img);
    let ip = pfs.resolve_path("big").expect("resolve");
    assert_eq!(pfs.read_all(&ip).expect("read"), data);

    let mut buf = vec![0_u8; 100];
    let at = 13 * BLOCK + 500;
    pfs.read(&ip, at as u64, &mut buf).expect("read");
    assert_eq!(buf, data[at..at + 100]);
}

#[test]
fn large_directory_lists_every_entry_once() {
    let mut b = ImageBuilder::with_options(BuildOptions {
        fanout: 8,
        ..BuildOptions::default()
    });
    let root = b.root();
    let dir = b.mkdir(root, "many");
    let expected: BTreeSet<String> = (0..150).map(|i| format!("entry-{i:03}")).collect();
    for name in &expected {
        b.file(dir, name, name.as_bytes().to_vec());
    }
    let pfs = mount(&b.build());
    let ip = pfs.resolve_path("many").expect("resolve");
    let entries = pfs.readdir(&ip).expect("readdir");
    assert_eq!(entries.len(), expected.len() + 2);
    let seen: BTreeSet<String> = entries[2..].iter().map(|e| e.name.clone()).collect();
    assert_eq!(seen, expected);
    assert_eq!(entries[1].inum, pfs.root().inum());

    let one = pfs.nresolve(&ip, b"entry-077").expect("nresolve");
    assert_eq!(pfs.read_all(&one).expect("read"), b"entry-077");
}

#[test]
fn long_names_resolve_and_overlong_names_are_rejected() {
    let mut b = ImageBuilder::new();
    let root = b.root();
    let long = "n".repeat(255);
    b.file(root, &long, b"long".to_vec());
    b.file(root, "short", b"short".to_vec());
    let pfs = mount(&b.build());

    let ip = pfs.nresolve(pfs.root(), long.as_bytes()).expect("255-byte name");
    assert_eq!(pfs.read_all(&ip).expect("read"), b"long");
    let names: Vec<String> = pfs
        .readdir(pfs.root())
        .expect("readdir")
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert!(names.contains(&long));

    let too_long = "n".repeat(256);
    assert!(matches!(
        pfs.nresolve(pfs.root(), too_long.as_bytes()),
        Err(H2Error::NameTooLong)
    ));
}

#[test]
fn embedded_inode_entries_are_still_resolved() {
    let mut b = ImageBuilder::with_options(BuildOptions {
        embedded_inode_entries: true,
        ..BuildOptions::default()
    });
    let root = b.root();
    let sub = b.mkdir(root, "sub");
    b.file(sub, "inner", vec![4_u8; 70_000]);
    b.file(root, "outer", b"x".to_vec());
    let pfs = mount(&b.build());

    let names: BTreeSet<String> = pfs
        .readdir(pfs.root())
        .expect("readdir")
        .into_iter()
        .skip(2)
        .map(|e| e.name)
        .collect();
    assert_eq!(names, BTreeSet::from(["outer".to_owned(), "sub".to_owned()]));
    let inner = pfs.resolve_path("sub/inner").expect("resolve");
    assert_eq!(inner.meta().size, 70_000);
    assert_eq!(pfs.read_all(&inner).expect("read"), vec![4_u8; 70_000]);
}

#[test]
fn path_resolution_handles_dots_and_errors() {
    let mut b = ImageBuilder::new();
    let root = b.root();
    let a = b.mkdir(root, "a");
    let bb = b.mkdir(a, "b");
    b.file(bb, "leaf", b"leaf".to_vec());
    let pfs = mount(&b.build());

    let leaf = pfs.resolve_path("/a/b/leaf").expect("resolve");
    assert_eq!(pfs.read_all(&leaf).expect("read"), b"leaf");
    let back = pfs.resolve_path("a/b/../b/./leaf").expect("resolve with dots");
    assert_eq!(back.inum(), leaf.inum());
    assert_eq!(pfs.resolve_path("a/..").expect("up").inum(), pfs.root().inum());
    assert_eq!(pfs.resolve_path("..").expect("root parent").inum(), pfs.root().inum());
    assert_eq!(pfs.resolve_path("a/b").expect("dir").inum(), bb.inum);
    assert_eq!(pfs.stat(&pfs.resolve_path("a/b").expect("dir")).iparent, a.inum);

    assert!(matches!(pfs.resolve_path("a/missing"), Err(H2Error::NotFound(_))));
    assert!(matches!(
        pfs.resolve_path("a/b/leaf/deeper"),
        Err(H2Error::NotDirectory)
    ));
    assert!(matches!(pfs.readdir(&leaf), Err(H2Error::NotDirectory)));
    let dir = pfs.resolve_path("a").expect("dir");
    assert!(matches!(
        pfs.read(&dir, 0, &mut [0_u8; 4]),
        Err(H2Error::IsDirectory)
    ));
}

#[test]
fn symlink_targets_are_read_not_followed() {
    let mut b = ImageBuilder::new();
    let root = b.root();
    b.file(root, "target", b"payload".to_vec());
    b.symlink(root, "link", "target");
    let pfs = mount(&b.build());

    let link = pfs.resolve_path("link").expect("resolve");
    assert_eq!(pfs.stat(&link).kind, ObjType::Symlink);
    assert_eq!(pfs.readlink(&link).expect("readlink"), b"target");
    assert!(matches!(
        pfs.read(&link, 0, &mut [0_u8; 4]),
        Err(H2Error::InvalidArgument(_))
    ));
    let target = pfs.resolve_path("target").expect("resolve");
    assert!(matches!(pfs.readlink(&target), Err(H2Error::InvalidArgument(_))));
}

#[test]
fn every_pfs_is_listed_and_mountable() {
    let mut b = ImageBuilder::new();
    let root = b.root();
    b.file(root, "in-root", b"root".to_vec());
    let data = b.add_pfs("data");
    b.file(data, "in-data", b"data".to_vec());
    let backup = b.add_pfs("backup");
    b.mkdir(backup, "snap");
    let img = b.build();
    let vol = volume(&img);

    let listed = list_pfs(&vol).expect("list");
    let names: BTreeSet<&str> = listed.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, BTreeSet::from(["ROOT", "data", "backup"]));
    for pair in listed.windows(2) {
        assert!(pair[0].key < pair[1].key);
    }
    assert!(listed.iter().all(|p| p.inum == 1));

    let pfs = Pfs::mount(Arc::clone(&vol), "data").expect("mount data");
    assert_eq!(pfs.name(), "data");
    let ip = pfs.resolve_path("in-data").expect("resolve");
    assert_eq!(pfs.read_all(&ip).expect("read"), b"data");
    assert!(matches!(pfs.resolve_path("in-root"), Err(H2Error::NotFound(_))));
    drop(pfs);

    let second = Pfs::mount(Arc::clone(&vol), "backup").expect("mount backup");
    assert_eq!(second.resolve_path("snap").expect("snap").meta().kind(), ObjType::Directory);
    drop(second);

    assert!(matches!(
        Pfs::mount(vol, "nope"),
        Err(H2Error::NotFound(_))
    ));
}

#[test]
fn repeated_resolution_reuses_the_cached_inode() {
    let mut b = ImageBuilder::new();
    let root = b.root();
    b.file(root, "f", b"f".to_vec());
    let pfs = mount(&b.build());

    let first = pfs.resolve_path("f").expect("resolve");
    let inodes = pfs.inodes().len();
    let second = pfs.resolve_path("f").expect("resolve");
    assert_eq!(first.inum(), second.inum());
    assert_eq!(pfs.inodes().len(), inodes);
    let again = pfs.lookup_inode(first.inum()).expect("lookup by inum");
    assert_eq!(again.inum(), first.inum());

    drop((first, second, again));
    assert!(pfs.inodes().lookup(2).is_none(), "freed with the last reference");
    let stats = pfs.stats();
    assert!(stats.xops.allocs >= 1);
    assert!(stats.xops.reuses >= 1);
    assert_eq!(stats.inodes, 1);
}
