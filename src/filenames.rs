use std::path::{Path, PathBuf};

use crate::{
    env::{write_data_to_file_sync, Env},
    error::{Error, Result},
};

pub type FileNum = u64;

const CURRENT: &str = "CURRENT";
const LOCK: &str = "LOCK";

#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum FileType {
    Log,
    DBLock,
    Table,
    Descriptor,
    Current,
    Temp,
    InfoLog,
}

pub fn parse_file_name<P: AsRef<Path>>(f: P) -> Result<(FileNum, FileType)> {
    let f = f.as_ref().to_str().unwrap_or_default();
    if f == CURRENT {
        Ok((0, FileType::Current))
    } else if f == LOCK {
        Ok((0, FileType::DBLock))
    } else if f == "LOG" || f == "LOG.old" {
        Ok((0, FileType::InfoLog))
    } else if let Some(rest) = f.strip_prefix("MANIFEST-") {
        if let Ok(num) = FileNum::from_str_radix(rest, 10) {
            Ok((num, FileType::Descriptor))
        } else {
            Err(Error::InvalidArgument(
                "manifest file number is invalid".into(),
            ))
        }
    } else if let Some(ix) = f.find('.') {
        if let Ok(num) = FileNum::from_str_radix(&f[..ix], 10) {
            match &f[ix + 1..] {
                "log" => Ok((num, FileType::Log)),
                "sst" | "ldb" => Ok((num, FileType::Table)),
                "dbtmp" => Ok((num, FileType::Temp)),
                _ => Err(Error::InvalidArgument("unknown file extension".into())),
            }
        } else {
            Err(Error::InvalidArgument("invalid file number".into()))
        }
    } else {
        Err(Error::InvalidArgument("unknown file type".into()))
    }
}

pub fn table_file_name<P: AsRef<Path>>(name: P, num: FileNum) -> PathBuf {
    assert!(num > 0);
    name.as_ref().join(format!("{:06}.ldb", num))
}

pub fn sst_table_file_name<P: AsRef<Path>>(name: P, num: FileNum) -> PathBuf {
    assert!(num > 0);
    name.as_ref().join(format!("{:06}.sst", num))
}

pub fn log_file_name<P: AsRef<Path>>(name: P, num: FileNum) -> PathBuf {
    name.as_ref().join(format!("{:06}.log", num))
}

pub fn descriptor_file_name<P: AsRef<Path>>(name: P, num: FileNum) -> PathBuf {
    name.as_ref().join(format!("MANIFEST-{:06}", num))
}

pub fn temp_file_name<P: AsRef<Path>>(name: P, num: FileNum) -> PathBuf {
    name.as_ref().join(format!("{:06}.dbtmp", num))
}

pub fn current_file_name<P: AsRef<Path>>(name: P) -> PathBuf {
    name.as_ref().join(CURRENT)
}

pub fn lock_file_name<P: AsRef<Path>>(name: P) -> PathBuf {
    name.as_ref().join(LOCK)
}

// Point CURRENT at the named manifest: write the name to a temp file,
// sync it, then rename over CURRENT.
pub fn set_current_file<E: Env>(env: E, db_name: &str, descriptor_num: FileNum) -> Result<()> {
    let mut content = format!("MANIFEST-{:06}", descriptor_num);
    content.push('\n');
    let tmp = temp_file_name(db_name, descriptor_num);

    let res = write_data_to_file_sync(env.clone(), content.as_bytes(), &tmp);
    if res.is_ok() {
        Ok(env.rename_file(&tmp, &current_file_name(db_name))?)
    } else {
        let _ = env.delete_file(&tmp);
        res.map_err(From::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_file_name() {
        assert_eq!(parse_file_name("CURRENT").unwrap(), (0, FileType::Current));
        assert_eq!(parse_file_name("LOCK").unwrap(), (0, FileType::DBLock));
        assert_eq!(parse_file_name("LOG").unwrap(), (0, FileType::InfoLog));
        assert_eq!(parse_file_name("LOG.old").unwrap(), (0, FileType::InfoLog));
        assert_eq!(
            parse_file_name("MANIFEST-000005").unwrap(),
            (5, FileType::Descriptor)
        );
        assert_eq!(parse_file_name("000123.log").unwrap(), (123, FileType::Log));
        assert_eq!(parse_file_name("000007.ldb").unwrap(), (7, FileType::Table));
        assert_eq!(parse_file_name("000007.sst").unwrap(), (7, FileType::Table));
        assert_eq!(parse_file_name("000009.dbtmp").unwrap(), (9, FileType::Temp));

        assert!(parse_file_name("MANIFEST-abc").is_err());
        assert!(parse_file_name("foo.bar").is_err());
        assert!(parse_file_name("unknown").is_err());
    }

    #[test]
    fn test_file_names() {
        assert_eq!(
            table_file_name("db", 7),
            PathBuf::from("db").join("000007.ldb")
        );
        assert_eq!(
            log_file_name("db", 12),
            PathBuf::from("db").join("000012.log")
        );
        assert_eq!(
            descriptor_file_name("db", 3),
            PathBuf::from("db").join("MANIFEST-000003")
        );
    }
}
