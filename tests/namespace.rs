// Directory-tree behavior through the facade: removal rules, readdir,
// create/remove cycles, and concurrent busy detection.

use sectorfs::{Filesystem, FsError, Handle, MemDisk, Task};
use std::sync::Arc;

fn mounted() -> (Filesystem, Task) {
    let disk = Arc::new(MemDisk::new(512));
    let fs = Filesystem::new(disk, true).unwrap();
    (fs, Task::new())
}

// A directory held open by one thread refuses removal from another.
#[test]
fn removing_an_open_directory_is_busy() {
    let (fs, task) = mounted();
    fs.mkdir(&task, "/d").unwrap();
    let held = fs.open_any(&task, "/d").unwrap();
    assert!(held.is_dir());

    let fs2 = fs.clone();
    let result = std::thread::spawn(move || {
        let task = Task::new();
        fs2.remove(&task, "/d")
    })
    .join()
    .unwrap();
    assert_eq!(result, Err(FsError::Busy));

    drop(held);
    fs.remove(&task, "/d").unwrap();
}

#[test]
fn removing_a_non_empty_directory_fails() {
    let (fs, task) = mounted();
    fs.mkdir(&task, "/a").unwrap();
    fs.create(&task, "/a/f", 0).unwrap();
    assert_eq!(fs.remove(&task, "/a"), Err(FsError::NotEmpty));
}

#[test]
fn create_remove_create_cycles() {
    let (fs, task) = mounted();
    for _ in 0..3 {
        fs.create(&task, "/f", 0).unwrap();
        fs.remove(&task, "/f").unwrap();
    }
    for _ in 0..3 {
        fs.mkdir(&task, "/d").unwrap();
        fs.remove(&task, "/d").unwrap();
    }
}

#[test]
fn readdir_lists_live_entries_only() {
    let (fs, task) = mounted();
    fs.mkdir(&task, "/dir").unwrap();
    for name in &["/dir/x", "/dir/y", "/dir/z"] {
        fs.create(&task, name, 0).unwrap();
    }
    fs.remove(&task, "/dir/y").unwrap();

    let mut dir = match fs.open_any(&task, "/dir").unwrap() {
        Handle::Dir(d) => d,
        Handle::File(_) => panic!("expected a directory"),
    };
    let mut names = Vec::new();
    while let Some(name) = dir.readdir() {
        names.push(name);
    }
    assert_eq!(names, vec!["x", "z"]);
}

// Several tasks resolving and creating concurrently under distinct
// directories do not interfere.
#[test]
fn concurrent_tasks_in_separate_directories() {
    let (fs, task) = mounted();
    for t in 0..4 {
        fs.mkdir(&task, &format!("/t{}", t)).unwrap();
    }

    let mut workers = Vec::new();
    for t in 0..4 {
        let fs = fs.clone();
        workers.push(std::thread::spawn(move || {
            let task = Task::new();
            fs.chdir(&task, &format!("/t{}", t)).unwrap();
            for i in 0..8 {
                let name = format!("f{}", i);
                fs.create(&task, &name, 0).unwrap();
                let mut f = fs.open(&task, &name).unwrap();
                f.write(format!("{}:{}", t, i).as_bytes()).unwrap();
            }
        }));
    }
    for w in workers {
        w.join().unwrap();
    }

    for t in 0..4 {
        for i in 0..8 {
            let mut f = fs.open(&task, &format!("/t{}/f{}", t, i)).unwrap();
            let mut buf = [0u8; 8];
            let n = f.read(&mut buf);
            assert_eq!(&buf[..n], format!("{}:{}", t, i).as_bytes());
        }
    }
}

// Writers extending a shared file concurrently keep the length
// monotonic and every opener sees a consistent final state.
#[test]
fn concurrent_writers_extend_a_shared_file() {
    let (fs, task) = mounted();
    fs.create(&task, "/shared", 0).unwrap();

    let mut workers = Vec::new();
    for t in 0..4u8 {
        let fs = fs.clone();
        workers.push(std::thread::spawn(move || {
            let task = Task::new();
            let f = fs.open(&task, "/shared").unwrap();
            // Each writer owns a disjoint 1 KiB stripe.
            let stripe = vec![t + 1; 1024];
            assert_eq!(f.write_at(&stripe, t as usize * 1024).unwrap(), 1024);
        }));
    }
    for w in workers {
        w.join().unwrap();
    }

    let f = fs.open(&task, "/shared").unwrap();
    assert_eq!(f.len(), 4096);
    let mut back = vec![0u8; 4096];
    assert_eq!(f.read_at(&mut back, 0), 4096);
    for t in 0..4usize {
        assert!(back[t * 1024..(t + 1) * 1024].iter().all(|&b| b == t as u8 + 1));
    }
}
