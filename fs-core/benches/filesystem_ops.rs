use criterion::{black_box, criterion_group, criterion_main, Criterion};
use extfs::{format_image, FileSystem, FsConfig, OpenMode};
use tempfile::TempDir;
use tokio::runtime::Runtime;

fn benchmark_file_operations(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let temp_dir = TempDir::new().unwrap();
    let image = temp_dir.path().join("bench.img");

    let mut fs = rt.block_on(async {
        format_image(&image, 8192, 1024).await.unwrap();
        FileSystem::open_root(&image, FsConfig::default()).await.unwrap()
    });

    c.bench_function("file_create_write_1kb", |b| {
        let data = vec![0u8; 1024];
        b.iter(|| {
            rt.block_on(async {
                fs.creat(0, "/bench").await.unwrap();
                let fd = fs.open(0, "/bench", OpenMode::Write).await.unwrap();
                fs.write(0, fd, black_box(&data)).await.unwrap();
                fs.close(0, fd).unwrap();
                fs.unlink(0, "/bench").await.unwrap();
            })
        });
    });

    // Create a test file for read benchmark
    rt.block_on(async {
        fs.creat(0, "/read").await.unwrap();
        let fd = fs.open(0, "/read", OpenMode::Write).await.unwrap();
        fs.write(0, fd, &vec![42u8; 64 * 1024]).await.unwrap();
        fs.close(0, fd).unwrap();
    });

    c.bench_function("file_read_64kb", |b| {
        b.iter(|| {
            let data = rt.block_on(fs.cat(0, "/read")).unwrap();
            black_box(data);
        });
    });

    rt.block_on(async {
        fs.mkdir(0, "/a").await.unwrap();
        fs.mkdir(0, "/a/b").await.unwrap();
        fs.mkdir(0, "/a/b/c").await.unwrap();
    });

    c.bench_function("resolve_depth_3", |b| {
        b.iter(|| {
            let found = rt.block_on(fs.resolve(0, black_box("/a/b/c"))).unwrap();
            black_box(found);
        });
    });

    rt.block_on(fs.shutdown()).unwrap();
}

criterion_group!(benches, benchmark_file_operations);
criterion_main!(benches);
