use std::{
    fs::{self, File},
    io::{ErrorKind, Read, Write},
    path::{Path, PathBuf},
};

#[cfg(unix)]
use std::os::unix::fs::FileExt;

use fs4::fs_std::FileExt as FileLockExt;

use super::{Env, IoError, IoResult, RandomAccessFile, SequencialFile, WritableFile};

pub struct PosixFile(File);

#[cfg(unix)]
impl RandomAccessFile for PosixFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> IoResult<usize> {
        Ok(self.0.read_at(buf, offset)?)
    }

    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> IoResult<()> {
        Ok(self.0.read_exact_at(buf, offset)?)
    }
}

impl WritableFile for PosixFile {
    fn append(&mut self, data: &[u8]) -> IoResult<()> {
        Ok(self.0.write_all(data)?)
    }

    fn flush(&mut self) -> IoResult<()> {
        Ok(self.0.flush()?)
    }

    fn sync(&mut self) -> IoResult<()> {
        Ok(self.0.sync_all()?)
    }
}

impl SequencialFile for PosixFile {
    fn read(&mut self, buf: &mut [u8]) -> IoResult<usize> {
        Ok(self.0.read(buf)?)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> IoResult<()> {
        Ok(self.0.read_exact(buf)?)
    }

    fn read_to_string(&mut self, buf: &mut String) -> IoResult<()> {
        Ok(self.0.read_to_string(buf).map(|_| ())?)
    }
}

pub struct PosixFileLock {
    file: File,
    path: PathBuf,
}

#[derive(Clone, Copy, Default)]
pub struct PosixEnv {}

impl Env for PosixEnv {
    type RandomAccessFile = PosixFile;
    type WritableFile = PosixFile;
    type SequencialFile = PosixFile;
    type FileLock = PosixFileLock;

    fn new_random_access_file(&self, name: &Path) -> IoResult<Self::RandomAccessFile> {
        Ok(PosixFile(fs::OpenOptions::new().read(true).open(name)?))
    }

    fn new_writable_file(&self, path: &Path) -> IoResult<Self::WritableFile> {
        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(PosixFile(file))
    }

    fn new_sequential_file(&self, path: &Path) -> IoResult<Self::SequencialFile> {
        let file = fs::OpenOptions::new().read(true).open(path)?;
        Ok(PosixFile(file))
    }

    fn file_size(&self, path: &Path) -> IoResult<usize> {
        let meta = fs::metadata(path)?;
        Ok(meta.len() as usize)
    }

    fn file_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn delete_file(&self, path: &Path) -> IoResult<()> {
        Ok(fs::remove_file(path)?)
    }

    fn rename_file(&self, from: &Path, to: &Path) -> IoResult<()> {
        Ok(fs::rename(from, to)?)
    }

    fn create_dir(&self, path: &Path) -> IoResult<()> {
        Ok(fs::create_dir(path)?)
    }

    fn get_children(&self, path: &Path, files: &mut Vec<String>) -> IoResult<()> {
        for file in fs::read_dir(path)? {
            let f = file?;
            if let Ok(name) = f.file_name().into_string() {
                files.push(name);
            }
        }
        Ok(())
    }

    fn lock_file(&self, path: &Path) -> IoResult<Self::FileLock> {
        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)?;
        match FileLockExt::try_lock_exclusive(&file) {
            Ok(true) => Ok(PosixFileLock {
                file,
                path: path.to_path_buf(),
            }),
            Ok(false) => Err(IoError::new(
                ErrorKind::WouldBlock,
                "lock already held by another process",
            )),
            Err(e) => Err(e.into()),
        }
    }

    fn unlock_file(&self, lock: Self::FileLock) -> IoResult<()> {
        FileLockExt::unlock(&lock.file)?;
        let _ = fs::remove_file(&lock.path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn test_dir() -> TempDir {
        tempfile::Builder::new().prefix("silt_env").tempdir().unwrap()
    }

    #[test]
    fn test_write_then_read_children() {
        let env = PosixEnv {};
        let file_names = &mut ["alpha", "beta", "gamma"];
        file_names.sort_unstable();

        let dir = test_dir();
        for file_name in file_names.iter() {
            let file_path = dir.path().join(file_name);
            let mut file = env.new_writable_file(&file_path).unwrap();
            file.append(file_name.as_bytes()).unwrap();
        }

        let mut files = Vec::new();
        env.get_children(dir.path(), &mut files).unwrap();
        files.sort_unstable();
        assert_eq!(files, file_names.iter().map(|s| s.to_string()).collect::<Vec<_>>());

        for file_name in file_names.iter() {
            let file_path = dir.path().join(file_name);
            assert!(env.file_exists(&file_path));
            assert_eq!(env.file_size(&file_path).unwrap(), file_name.len());

            let mut file = env.new_sequential_file(&file_path).unwrap();
            let mut content = String::new();
            file.read_to_string(&mut content).unwrap();
            assert_eq!(content, *file_name);
        }
    }

    #[test]
    fn test_random_access_read() {
        let env = PosixEnv {};
        let dir = test_dir();
        let path = dir.path().join("random");
        let mut file = env.new_writable_file(&path).unwrap();
        file.append(b"0123456789").unwrap();
        file.sync().unwrap();

        let file = env.new_random_access_file(&path).unwrap();
        let mut buf = [0u8; 4];
        file.read_exact_at(&mut buf, 3).unwrap();
        assert_eq!(&buf, b"3456");
    }

    #[test]
    fn test_lock_file_exclusion() {
        let env = PosixEnv {};
        let dir = test_dir();
        let path = dir.path().join("LOCK");

        let lock = env.lock_file(&path).unwrap();
        assert!(env.lock_file(&path).is_err());
        env.unlock_file(lock).unwrap();

        let lock = env.lock_file(&path).unwrap();
        env.unlock_file(lock).unwrap();
    }
}
