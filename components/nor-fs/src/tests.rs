use generic_array::typenum::{U1, U256, U32, U64};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::vec::Vec;

use crate::{
    BlockDevice, DirEntry, Error, FileType, Filesystem, Metadata, OpenFlags, SeekFrom,
};

crate::ram_flash!(
    name = Flash,
    block_size = 4096,
    block_count = 256,
    read_size = 1,
    prog_size = 256,
    block_cycles = 500,
    cache_size_ty = U256,
    lookahead_size_ty = U32,
);

// eight-block allocator window, so most operations wrap around it
crate::ram_flash!(
    name = Small,
    block_size = 512,
    block_count = 32,
    read_size = 1,
    prog_size = 16,
    block_cycles = 100,
    cache_size_ty = U64,
    lookahead_size_ty = U1,
);

type Fs = Filesystem<Flash>;
type SmallFs = Filesystem<Small>;

const PAYLOAD: usize = 4096 - 4;

fn mount<D: BlockDevice>(dev: D) -> Filesystem<D> {
    Filesystem::<D>::mount(dev).map_err(|f| f.error).unwrap()
}

fn formatted() -> Fs {
    let mut flash = Flash::new();
    Fs::format(&mut flash).unwrap();
    mount(flash)
}

fn small_with(files: &[(&str, &[u8])]) -> Small {
    let mut flash = Small::new();
    SmallFs::format(&mut flash).unwrap();
    let mut fs = mount(flash);
    for (path, data) in files {
        write_file(&mut fs, path, data);
    }
    fs.unmount()
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

fn write_file<D: BlockDevice>(fs: &mut Filesystem<D>, path: &str, data: &[u8]) {
    let flags = OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE;
    let file = fs.open(path, flags).unwrap();
    assert_eq!(fs.write(file, data).unwrap(), data.len());
    fs.close(file).unwrap();
}

fn read_file<D: BlockDevice>(fs: &mut Filesystem<D>, path: &str) -> Vec<u8> {
    let file = fs.open(path, OpenFlags::READ).unwrap();
    let mut out = Vec::new();
    let mut buf = [0u8; 100];
    loop {
        let n = fs.read(file, &mut buf).unwrap();
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    fs.close(file).unwrap();
    out
}

fn list<D: BlockDevice>(fs: &mut Filesystem<D>, path: &str) -> Vec<DirEntry> {
    let dir = fs.open_dir(path).unwrap();
    let mut entries = Vec::new();
    while let Some(entry) = fs.read_dir(dir).unwrap() {
        entries.push(entry);
    }
    fs.close_dir(dir).unwrap();
    entries
}

#[test]
fn format_then_mount() {
    let mut flash = Flash::new();
    assert!(!Fs::is_mountable(&mut flash));
    let failure = Fs::mount(flash).err().unwrap();
    assert_eq!(failure.error, Error::NotFormatted);

    let mut flash = failure.device;
    Fs::format(&mut flash).unwrap();
    assert!(Fs::is_mountable(&mut flash));

    let mut fs = mount(flash);
    assert!(list(&mut fs, "/").is_empty());
    assert_eq!(
        fs.metadata("/").unwrap(),
        Metadata {
            file_type: FileType::Dir,
            size: 0
        }
    );
    let info = fs.info().unwrap();
    assert_eq!(info.block_size, 4096);
    assert_eq!(info.block_count, 256);
    assert_eq!(info.blocks_used, 3);
    assert!(!info.worn);
}

#[test]
fn contents_survive_remount() {
    let sizes = [
        0,
        1,
        crate::INLINE_MAX,
        crate::INLINE_MAX + 1,
        PAYLOAD - 1,
        PAYLOAD,
        PAYLOAD + 1,
        4095,
        4096,
        4097,
        3 * PAYLOAD + 17,
    ];
    let mut fs = formatted();
    for (i, &len) in sizes.iter().enumerate() {
        let path = format!("/file{i}");
        write_file(&mut fs, &path, &pattern(len, i as u8));
    }

    let mut fs = mount(fs.unmount());
    for (i, &len) in sizes.iter().enumerate() {
        let path = format!("/file{i}");
        assert_eq!(read_file(&mut fs, &path), pattern(len, i as u8), "{len} bytes");
        assert_eq!(fs.metadata(&path).unwrap().size, len as u32);
    }
}

#[test]
fn create_then_close_makes_the_file_exist() {
    let mut fs = formatted();
    let file = fs.open("/empty", OpenFlags::CREATE).unwrap();
    assert!(!fs.exists("/empty").unwrap());
    fs.close(file).unwrap();
    assert!(fs.exists("/empty").unwrap());
    assert_eq!(fs.metadata("/empty").unwrap().size, 0);
}

#[test]
fn unclosed_writes_are_lost_on_power_loss() {
    let mut fs = formatted();
    write_file(&mut fs, "/data", b"before");

    let file = fs.open("/data", OpenFlags::WRITE).unwrap();
    fs.write(file, &pattern(3 * PAYLOAD, 7)).unwrap();
    assert_eq!(fs.file_size(file).unwrap(), 3 * PAYLOAD as u32);
    assert_eq!(fs.metadata("/data").unwrap().size, 6);

    // dropping the filesystem stands in for the power loss
    let mut fs = mount(fs.unmount());
    assert_eq!(read_file(&mut fs, "/data"), b"before");
}

#[test]
fn power_loss_during_close_keeps_old_or_new() {
    let old = pattern(700, 1);
    let new = pattern(1500, 2);
    let mut completed = false;
    for budget in 0..200 {
        let mut flash = small_with(&[("/f", &old)]);
        flash.cut_power_after(budget);

        let mut fs = mount(flash);
        let file = fs.open("/f", OpenFlags::WRITE).unwrap();
        let written = fs.write(file, &new);
        let closed = fs.close(file);

        let mut flash = fs.unmount();
        flash.restore_power();
        let mut fs = mount(flash);
        let content = read_file(&mut fs, "/f");
        if written.is_ok() && closed.is_ok() {
            assert_eq!(content, new);
            completed = true;
            break;
        }
        assert!(content == old || content == new, "budget {budget}");
    }
    assert!(completed);
}

#[test]
fn power_loss_during_rename_keeps_old_or_new() {
    let a = pattern(900, 3);
    let b = pattern(20, 4);
    let mut completed = false;
    for budget in 0..100 {
        let mut flash = small_with(&[("/a", &a), ("/b", &b)]);
        flash.cut_power_after(budget);

        let mut fs = mount(flash);
        let renamed = fs.rename("/a", "/b");

        let mut flash = fs.unmount();
        flash.restore_power();
        let mut fs = mount(flash);
        let moved = !fs.exists("/a").unwrap();
        if moved {
            assert_eq!(read_file(&mut fs, "/b"), a, "budget {budget}");
        } else {
            assert!(renamed.is_err());
            assert_eq!(read_file(&mut fs, "/a"), a);
            assert_eq!(read_file(&mut fs, "/b"), b);
        }
        if renamed.is_ok() {
            completed = true;
            break;
        }
    }
    assert!(completed);
}

#[test]
fn directories() {
    let mut fs = formatted();
    fs.create_dir("/d").unwrap();
    fs.create_dir("/d/e").unwrap();
    assert_eq!(fs.create_dir("/d"), Err(Error::Exists));
    assert_eq!(fs.create_dir("/"), Err(Error::Exists));
    assert_eq!(fs.create_dir("/missing/x"), Err(Error::NotFound));
    write_file(&mut fs, "/d/e/f", b"nested");

    assert_eq!(fs.remove("/d"), Err(Error::NotEmpty));
    assert_eq!(fs.remove("/d/e"), Err(Error::NotEmpty));
    assert_eq!(fs.remove("/"), Err(Error::Invalid));
    assert_eq!(fs.open("/d", OpenFlags::READ), Err(Error::IsDir));
    assert_eq!(fs.open("/", OpenFlags::READ), Err(Error::IsDir));
    assert_eq!(fs.open_dir("/d/e/f").err(), Some(Error::NotDir));

    let mut fs = mount(fs.unmount());
    assert_eq!(read_file(&mut fs, "/d/e/f"), b"nested");
    fs.remove("/d/e/f").unwrap();
    fs.remove("/d/e").unwrap();
    fs.remove("/d").unwrap();
    assert!(!fs.exists("/d").unwrap());
    assert_eq!(fs.info().unwrap().blocks_used, 3);
}

#[test]
fn directory_listing_is_in_insertion_order() {
    let mut fs = formatted();
    write_file(&mut fs, "/b", &pattern(5000, 0));
    fs.create_dir("/a").unwrap();
    write_file(&mut fs, "/c", b"c");

    let entries = list(&mut fs, "/");
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, ["b", "a", "c"]);
    assert_eq!(entries[0].metadata.size, 5000);
    assert!(entries[1].metadata.is_dir());
    assert!(entries[2].metadata.is_file());
    assert!(list(&mut fs, "/a").is_empty());
}

#[test]
fn rename_rules() {
    let mut fs = formatted();
    write_file(&mut fs, "/x", b"x content");
    write_file(&mut fs, "/y", b"y content");
    fs.create_dir("/d").unwrap();
    fs.create_dir("/full").unwrap();
    write_file(&mut fs, "/full/f", b"");

    fs.rename("/x", "/y").unwrap();
    assert!(!fs.exists("/x").unwrap());
    assert_eq!(read_file(&mut fs, "/y"), b"x content");

    assert_eq!(fs.rename("/y", "/d"), Err(Error::IsDir));
    assert_eq!(fs.rename("/d", "/y"), Err(Error::NotDir));
    assert_eq!(fs.rename("/d", "/full"), Err(Error::NotEmpty));
    assert_eq!(fs.rename("/d", "/d/sub"), Err(Error::Invalid));
    assert_eq!(fs.rename("/", "/z"), Err(Error::Invalid));
    assert_eq!(fs.rename("/nope", "/z"), Err(Error::NotFound));
    fs.rename("/y", "/y").unwrap();

    fs.rename("/y", "/full/y").unwrap();
    fs.rename("/full", "/d").unwrap();
    assert_eq!(read_file(&mut fs, "/d/y"), b"x content");
    assert_eq!(read_file(&mut fs, "/d/f"), b"");
    assert!(!fs.exists("/full").unwrap());
}

#[test]
fn open_handles_follow_renames() {
    let mut fs = formatted();
    fs.create_dir("/logs").unwrap();
    let file = fs
        .open("/logs/today", OpenFlags::WRITE | OpenFlags::CREATE)
        .unwrap();
    fs.write(file, b"entry").unwrap();
    fs.rename("/logs", "/archive").unwrap();
    fs.close(file).unwrap();

    assert!(!fs.exists("/logs").unwrap());
    assert_eq!(read_file(&mut fs, "/archive/today"), b"entry");
}

#[test]
fn removed_files_stay_removed() {
    let mut fs = formatted();
    write_file(&mut fs, "/gone", b"data");
    let file = fs.open("/gone", OpenFlags::READ | OpenFlags::WRITE).unwrap();
    fs.remove("/gone").unwrap();
    fs.write(file, &pattern(6000, 1)).unwrap();

    let mut buf = [0u8; 4];
    fs.seek(file, SeekFrom::Start(0)).unwrap();
    assert_eq!(fs.read(file, &mut buf).unwrap(), 4);
    fs.close(file).unwrap();
    assert!(!fs.exists("/gone").unwrap());
}

#[test]
fn readers_keep_their_snapshot() {
    let mut fs = small_fs(&[("/f", &pattern(1200, 5))]);
    let reader = fs.open("/f", OpenFlags::READ).unwrap();
    let dir = fs.open_dir("/").unwrap();

    for round in 0..20u8 {
        write_file(&mut fs, "/f", &pattern(1000, round));
        write_file(&mut fs, "/tmp", &pattern(1500, round));
        fs.remove("/tmp").unwrap();
    }

    let mut content = Vec::new();
    let mut buf = [0u8; 64];
    loop {
        let n = fs.read(reader, &mut buf).unwrap();
        if n == 0 {
            break;
        }
        content.extend_from_slice(&buf[..n]);
    }
    assert_eq!(content, pattern(1200, 5));

    let entry = fs.read_dir(dir).unwrap().unwrap();
    assert_eq!(entry.name, "f");
    assert_eq!(entry.metadata.size, 1200);
    assert_eq!(fs.read_dir(dir).unwrap(), None);
}

fn small_fs(files: &[(&str, &[u8])]) -> SmallFs {
    mount(small_with(files))
}

#[test]
fn path_spellings() {
    let mut fs = formatted();
    fs.create_dir("/dir/").unwrap();
    write_file(&mut fs, "file", b"1");

    let stat = fs.metadata("/dir").unwrap();
    assert_eq!(fs.metadata("/dir/").unwrap(), stat);
    assert_eq!(fs.metadata("//dir/.").unwrap(), stat);
    assert_eq!(fs.metadata("/dir").unwrap(), stat);
    assert_eq!(fs.metadata("/file/"), Err(Error::NotDir));
    assert_eq!(fs.metadata(""), Err(Error::Invalid));
    assert_eq!(fs.metadata("//").unwrap().file_type, FileType::Dir);
    assert_eq!(fs.metadata("/dir/../file").unwrap().size, 1);
    assert_eq!(fs.metadata("/file/x"), Err(Error::NotDir));
    assert_eq!(
        fs.open("/new/", OpenFlags::WRITE | OpenFlags::CREATE),
        Err(Error::NotDir)
    );
}

#[test]
fn handle_pools_are_bounded() {
    let mut fs = formatted();
    let flags = OpenFlags::WRITE | OpenFlags::CREATE;
    let a = fs.open("/a", flags).unwrap();
    let b = fs.open("/b", flags).unwrap();
    let c = fs.open("/c", flags).unwrap();
    assert_eq!(fs.open("/d", flags), Err(Error::NoHandles));

    fs.close(b).unwrap();
    assert_eq!(fs.close(b), Err(Error::BadHandle));
    assert_eq!(fs.write(b, b"x"), Err(Error::BadHandle));
    let d = fs.open("/d", flags).unwrap();
    for file in [a, c, d] {
        fs.close(file).unwrap();
    }

    let dirs = [
        fs.open_dir("/").unwrap(),
        fs.open_dir("/").unwrap(),
        fs.open_dir("/").unwrap(),
    ];
    assert_eq!(fs.open_dir("/").err(), Some(Error::NoHandles));
    for dir in dirs {
        fs.close_dir(dir).unwrap();
    }
    assert!(fs.open_dir("/").is_ok());
}

#[test]
fn failed_open_returns_the_slot() {
    let mut fs = formatted();
    for _ in 0..10 {
        assert_eq!(fs.open("/missing", OpenFlags::READ), Err(Error::NotFound));
    }
    let file = fs.open("/present", OpenFlags::CREATE | OpenFlags::WRITE).unwrap();
    fs.close(file).unwrap();
}

#[test]
fn access_modes() {
    let mut fs = formatted();
    write_file(&mut fs, "/f", b"abc");
    let file = fs.open("/f", OpenFlags::READ).unwrap();
    assert_eq!(fs.write(file, b"x"), Err(Error::NotWritable));
    fs.close(file).unwrap();

    let file = fs.open("/f", OpenFlags::WRITE).unwrap();
    assert_eq!(fs.read(file, &mut [0u8; 4]), Err(Error::NotReadable));
    fs.close(file).unwrap();

    assert_eq!(
        fs.open("/f", OpenFlags::READ | OpenFlags::TRUNCATE),
        Err(Error::Invalid)
    );
    let file = fs.open("/f", OpenFlags::WRITE | OpenFlags::TRUNCATE).unwrap();
    fs.close(file).unwrap();
    assert_eq!(fs.metadata("/f").unwrap().size, 0);
}

#[test]
fn seek_past_end_zero_fills() {
    let mut fs = formatted();
    let flags = OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE;
    let file = fs.open("/sparse", flags).unwrap();
    assert_eq!(fs.seek(file, SeekFrom::Start(10)).unwrap(), 10);
    assert_eq!(fs.read(file, &mut [0u8; 4]).unwrap(), 0);
    fs.write(file, b"x").unwrap();
    assert_eq!(fs.tell(file).unwrap(), 11);
    fs.seek(file, SeekFrom::End(PAYLOAD as i32)).unwrap();
    fs.write(file, b"y").unwrap();
    assert_eq!(fs.seek(file, SeekFrom::Current(-1_000_000)), Err(Error::Invalid));
    fs.close(file).unwrap();

    let content = read_file(&mut fs, "/sparse");
    assert_eq!(content.len(), 11 + PAYLOAD + 1);
    assert!(content[..10].iter().all(|&b| b == 0));
    assert_eq!(content[10], b'x');
    assert!(content[11..11 + PAYLOAD].iter().all(|&b| b == 0));
    assert_eq!(content[11 + PAYLOAD], b'y');
}

#[test]
fn erased_value_is_not_assumed() {
    let mut flash = Flash::new();
    flash.set_erase_fill(0x00);
    Fs::format(&mut flash).unwrap();
    let mut fs = mount(flash);
    write_file(&mut fs, "/zeros", &pattern(2 * PAYLOAD + 3, 9));
    fs.create_dir("/d").unwrap();

    let mut fs = mount(fs.unmount());
    assert_eq!(read_file(&mut fs, "/zeros"), pattern(2 * PAYLOAD + 3, 9));
    assert!(fs.metadata("/d").unwrap().is_dir());
}

#[test]
fn freed_blocks_are_reused() {
    let mut fs = small_fs(&[]);
    for round in 0..200u32 {
        let data = pattern(2000, round as u8);
        write_file(&mut fs, "/churn", &data);
        if round % 3 == 0 {
            fs.remove("/churn").unwrap();
        }
    }

    let mut fs = mount(fs.unmount());
    let mut written = 0;
    loop {
        let path = format!("/fill{written}");
        let file = fs.open(&path, OpenFlags::WRITE | OpenFlags::CREATE).unwrap();
        let result = fs.write(file, &pattern(1000, 0));
        let closed = fs.close(file);
        if result == Err(Error::NoSpace) || closed == Err(Error::NoSpace) {
            break;
        }
        result.unwrap();
        closed.unwrap();
        written += 1;
        assert!(written < 32);
    }
    assert!(written > 0);
    fs.remove("/fill0").unwrap();
    write_file(&mut fs, "/after", &pattern(100, 1));
    assert_eq!(read_file(&mut fs, "/after"), pattern(100, 1));
}

#[test]
fn superblock_moves_between_the_pair() {
    let mut fs = small_fs(&[]);
    let flash = fs.unmount();
    let before = [flash.erase_count(0), flash.erase_count(1)];
    let mut fs = mount(flash);

    // ten records fit one superblock block, 119 commits
    for i in 0..60 {
        fs.create_dir(&format!("/d{i}")).unwrap();
        if i > 0 {
            fs.remove(&format!("/d{}", i - 1)).unwrap();
        }
    }
    let info = fs.info().unwrap();
    assert!(info.superblock_erases >= 8);
    let revision = info.revision;

    let flash = fs.unmount();
    assert!(flash.erase_count(0) >= before[0] + 4);
    assert!(flash.erase_count(1) >= before[1] + 4);
    let mut fs = mount(flash);
    assert_eq!(fs.info().unwrap().revision, revision);
    assert!(fs.exists("/d59").unwrap());
    assert!(!fs.exists("/d58").unwrap());
}

#[test]
fn lost_root_is_corrupt() {
    let mut fs = formatted();
    write_file(&mut fs, "/a", &pattern(5000, 3));
    let mut flash = fs.unmount();
    for block in 2..Flash::BLOCK_COUNT as u32 {
        flash.erase(block).unwrap();
    }

    assert!(!Fs::is_mountable(&mut flash));
    let failure = Fs::mount(flash).err().unwrap();
    assert_eq!(failure.error, Error::Corrupt);

    let mut flash = failure.device;
    Fs::format(&mut flash).unwrap();
    let mut fs = mount(flash);
    assert!(!fs.exists("/a").unwrap());
}

#[test]
fn random_writes_match_a_model() {
    let mut rng = StdRng::seed_from_u64(0x6e6f_7266);
    let mut fs = formatted();
    let flags = OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE;
    let file = fs.open("/random", flags).unwrap();
    let mut model: Vec<u8> = Vec::new();

    for step in 0..60 {
        let pos = rng.gen_range(0..=model.len() + 100);
        let mut data = vec![0u8; rng.gen_range(1..3 * PAYLOAD)];
        rng.fill(&mut data[..]);

        fs.seek(file, SeekFrom::Start(pos as u32)).unwrap();
        fs.write(file, &data).unwrap();
        if model.len() < pos + data.len() {
            model.resize(pos + data.len(), 0);
        }
        model[pos..pos + data.len()].copy_from_slice(&data);

        if step % 7 == 0 {
            fs.sync(file).unwrap();
        }
        if step % 5 == 0 {
            let at = rng.gen_range(0..model.len());
            let mut buf = [0u8; 300];
            fs.seek(file, SeekFrom::Start(at as u32)).unwrap();
            let n = fs.read(file, &mut buf).unwrap();
            assert_eq!(&buf[..n], &model[at..(at + 300).min(model.len())]);
        }
    }
    fs.close(file).unwrap();

    let mut fs = mount(fs.unmount());
    assert_eq!(read_file(&mut fs, "/random"), model);
}

quickcheck::quickcheck! {
    fn written_data_reads_back(data: Vec<u8>, chunk: u8) -> bool {
        let mut fs = small_fs(&[]);
        let file = fs.open("/q", OpenFlags::WRITE | OpenFlags::CREATE).unwrap();
        for part in data.chunks(chunk as usize + 1) {
            fs.write(file, part).unwrap();
        }
        fs.close(file).unwrap();
        read_file(&mut fs, "/q") == data
    }
}
