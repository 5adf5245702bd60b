use extfs::{format_image, FileSystem, FsConfig, FsError, OpenMode};
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

async fn fresh_fs(blocks: u32) -> (TempDir, FileSystem) {
    env_logger::builder().is_test(true).try_init().ok();
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let image = temp_dir.path().join("disk.img");
    format_image(&image, blocks, 256).await.expect("Failed to format image");
    let fs = FileSystem::open_root(&image, FsConfig::default())
        .await
        .expect("Failed to open root");
    (temp_dir, fs)
}

fn payload(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen()).collect()
}

async fn write_file(fs: &mut FileSystem, path: &str, data: &[u8]) {
    fs.creat(0, path).await.unwrap();
    let fd = fs.open(0, path, OpenMode::Write).await.unwrap();
    assert_eq!(fs.write(0, fd, data).await.unwrap(), data.len());
    fs.close(0, fd).unwrap();
}

#[tokio::test]
async fn test_hello_world() {
    let (_temp_dir, mut fs) = fresh_fs(1024).await;
    write_file(&mut fs, "/hello", b"hello world").await;

    let fd = fs.open(0, "/hello", OpenMode::Read).await.unwrap();
    assert_eq!(fs.read(0, fd, 100).await.unwrap(), b"hello world");
    assert!(fs.read(0, fd, 100).await.unwrap().is_empty());
    fs.close(0, fd).unwrap();
    assert_eq!(fs.stat(0, "/hello").await.unwrap().size, 11);
}

#[tokio::test]
async fn test_large_file_through_double_indirect() {
    let (_temp_dir, mut fs) = fresh_fs(8192).await;
    // 12 direct + 256 single-indirect blocks, then 10 more through the double tier.
    let data = payload((12 + 256 + 10) * 1024 + 123, 7);
    write_file(&mut fs, "/big", &data).await;

    assert_eq!(fs.cat(0, "/big").await.unwrap(), data);
    let st = fs.stat(0, "/big").await.unwrap();
    assert_eq!(st.size as usize, data.len());
    // 279 data blocks, one single-indirect block, a double-indirect root and one sub-block.
    assert_eq!(st.blocks, (279 + 3) * 2);

    let fd = fs.open(0, "/big", OpenMode::Read).await.unwrap();
    let first = fs.logical_to_physical(0, fd, 0, false).await.unwrap();
    let deep = fs.logical_to_physical(0, fd, 12 + 256 + 5, false).await.unwrap();
    assert_ne!(first, 0);
    assert_ne!(deep, 0);
    assert_eq!(fs.logical_to_physical(0, fd, 5000, false).await.unwrap(), 0);
    fs.close(0, fd).unwrap();
}

#[tokio::test]
async fn test_unlink_returns_every_block() {
    let (_temp_dir, mut fs) = fresh_fs(8192).await;
    let free_before = fs
        .mount_table()
        .device(fs.root_device())
        .unwrap()
        .read_superblock()
        .await
        .unwrap()
        .free_blocks_count;

    write_file(&mut fs, "/big", &payload(300 * 1024, 11)).await;
    fs.unlink(0, "/big").await.unwrap();

    let sb = fs.mount_table().device(fs.root_device()).unwrap().read_superblock().await.unwrap();
    assert_eq!(sb.free_blocks_count, free_before);
}

#[tokio::test]
async fn test_seek_and_overwrite() {
    let (_temp_dir, mut fs) = fresh_fs(1024).await;
    write_file(&mut fs, "/f", &[b'a'; 2048]).await;

    let fd = fs.open(0, "/f", OpenMode::ReadWrite).await.unwrap();
    assert_eq!(fs.lseek(0, fd, 1020).unwrap(), 0);
    fs.write(0, fd, b"XXXXXXXX").await.unwrap();
    assert_eq!(fs.lseek(0, fd, 1016).unwrap(), 1028);
    assert_eq!(fs.read(0, fd, 16).await.unwrap(), b"aaaaXXXXXXXXaaaa");
    assert!(matches!(fs.lseek(0, fd, 4096), Err(FsError::InvalidSeek(4096))));
    fs.close(0, fd).unwrap();
    assert_eq!(fs.stat(0, "/f").await.unwrap().size, 2048);
}

#[tokio::test]
async fn test_append_mode_starts_at_end() {
    let (_temp_dir, mut fs) = fresh_fs(1024).await;
    write_file(&mut fs, "/log", b"one\n").await;

    let fd = fs.open(0, "/log", OpenMode::Append).await.unwrap();
    fs.write(0, fd, b"two\n").await.unwrap();
    fs.close(0, fd).unwrap();
    assert_eq!(fs.cat(0, "/log").await.unwrap(), b"one\ntwo\n");
}

#[tokio::test]
async fn test_access_modes_are_enforced() {
    let (_temp_dir, mut fs) = fresh_fs(1024).await;
    write_file(&mut fs, "/f", b"data").await;

    let rd = fs.open(0, "/f", OpenMode::Read).await.unwrap();
    assert!(matches!(fs.write(0, rd, b"x").await, Err(FsError::BadAccessMode)));
    let wr = fs.open(0, "/f", OpenMode::Write).await.unwrap();
    assert!(matches!(fs.read(0, wr, 1).await, Err(FsError::BadAccessMode)));
    fs.close(0, rd).unwrap();
    fs.close(0, wr).unwrap();

    fs.mkdir(0, "/d").await.unwrap();
    assert!(matches!(fs.open(0, "/d", OpenMode::Read).await, Err(FsError::IsADirectory)));
    assert!(matches!(fs.close(0, rd), Err(FsError::InvalidDescriptor)));
}

#[tokio::test]
async fn test_dup_shares_the_cursor() {
    let (_temp_dir, mut fs) = fresh_fs(1024).await;
    write_file(&mut fs, "/f", b"0123456789").await;

    let fd = fs.open(0, "/f", OpenMode::Read).await.unwrap();
    let copy = fs.dup(0, fd).unwrap();
    let other = fs.dup_to(0, fd, 1).unwrap();
    assert_eq!(fs.read(0, fd, 3).await.unwrap(), b"012");
    assert_eq!(fs.read(0, copy, 3).await.unwrap(), b"345");
    assert_eq!(fs.read(1, other, 3).await.unwrap(), b"678");

    fs.close(0, fd).unwrap();
    assert_eq!(fs.read(0, copy, 3).await.unwrap(), b"9");
    assert_eq!(fs.list_descriptors(0).unwrap().len(), 1);
    fs.close(0, copy).unwrap();
    fs.close(1, other).unwrap();
    assert_eq!(fs.open_files().in_use(), 0);
}

#[tokio::test]
async fn test_descriptor_table_fills_up() {
    let (_temp_dir, mut fs) = fresh_fs(1024).await;
    write_file(&mut fs, "/f", b"x").await;

    let limit = fs.config().descriptors_per_process;
    let mut fds = Vec::new();
    for _ in 0..limit {
        fds.push(fs.open(0, "/f", OpenMode::Read).await.unwrap());
    }
    assert!(matches!(fs.open(0, "/f", OpenMode::Read).await, Err(FsError::TooManyOpenFiles)));
    for fd in fds {
        fs.close(0, fd).unwrap();
    }
}

#[tokio::test]
async fn test_copy_and_overwrite() {
    let (_temp_dir, mut fs) = fresh_fs(4096).await;
    let data = payload(5000, 3);
    write_file(&mut fs, "/src", &data).await;

    fs.copy(0, "/src", "/dst").await.unwrap();
    assert_eq!(fs.cat(0, "/dst").await.unwrap(), data);
    assert_ne!(fs.resolve(0, "/src").await.unwrap(), fs.resolve(0, "/dst").await.unwrap());

    write_file(&mut fs, "/short", b"short").await;
    fs.copy(0, "/short", "/dst").await.unwrap();
    assert_eq!(fs.cat(0, "/dst").await.unwrap(), b"short");
}

#[tokio::test]
async fn test_shared_open_file_pool_fills_up() {
    env_logger::builder().is_test(true).try_init().ok();
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let image = temp_dir.path().join("disk.img");
    format_image(&image, 1024, 128).await.unwrap();
    let config = FsConfig { open_file_slots: 3, ..FsConfig::default() };
    let mut fs = FileSystem::open_root(&image, config).await.unwrap();
    write_file(&mut fs, "/f", b"pool").await;

    let a = fs.open(0, "/f", OpenMode::Read).await.unwrap();
    fs.open(0, "/f", OpenMode::Read).await.unwrap();
    fs.open(1, "/f", OpenMode::Read).await.unwrap();

    // Process 2 has free descriptors, but the shared pool is exhausted.
    assert!(matches!(fs.open(2, "/f", OpenMode::Read).await, Err(FsError::TooManyOpenFiles)));
    assert!(fs.list_descriptors(2).unwrap().is_empty());

    // Duplicates share an entry and need no new pool slot.
    let shared = fs.dup_to(0, a, 2).unwrap();
    assert_eq!(fs.read(2, shared, 4).await.unwrap(), b"pool");

    fs.close(0, a).unwrap();
    fs.close(2, shared).unwrap();
    fs.open(2, "/f", OpenMode::Read).await.unwrap();
}
