use heapless::Vec;

use crate::error::{Error, Result};
use crate::{MAX_DEPTH, NAME_MAX, PATH_MAX};

pub(crate) type PathBuf = heapless::String<PATH_MAX>;

/// A normalised path: no empty, `.` or `..` components.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Path<'a> {
    comps: Vec<&'a str, MAX_DEPTH>,
    dir_hint: bool,
}

pub(crate) enum Rebase {
    Unaffected,
    Moved(PathBuf),
    /// The new location can not be expressed as a path.
    Lost,
}

impl<'a> Path<'a> {
    pub fn parse(path: &'a str) -> Result<Self> {
        if path.is_empty() || path.contains('\0') {
            return Err(Error::Invalid);
        }
        let mut comps = Vec::new();
        for comp in path.split('/') {
            match comp {
                "" | "." => {}
                ".." => {
                    comps.pop();
                }
                name => {
                    if name.len() > NAME_MAX {
                        return Err(Error::NameTooLong);
                    }
                    comps.push(name).map_err(|_| Error::NameTooLong)?;
                }
            }
        }
        let dir_hint = !comps.is_empty() && path.ends_with('/');
        Ok(Self { comps, dir_hint })
    }

    pub fn is_root(&self) -> bool {
        self.comps.is_empty()
    }

    pub fn components(&self) -> &[&'a str] {
        &self.comps
    }

    pub fn depth(&self) -> usize {
        self.comps.len()
    }

    /// Components of the containing directory, empty for the root.
    pub fn parent(&self) -> &[&'a str] {
        let n = self.comps.len().saturating_sub(1);
        &self.comps[..n]
    }

    pub fn name(&self) -> Result<&'a str> {
        self.comps.last().copied().ok_or(Error::Invalid)
    }

    /// Written with a trailing slash, the target has to be a directory.
    pub fn dir_hint(&self) -> bool {
        self.dir_hint
    }

    /// Equal to `prefix` or below it.
    pub fn is_within(&self, prefix: &Path) -> bool {
        self.comps.starts_with(prefix.components())
    }

    pub fn to_buf(&self) -> Result<PathBuf> {
        join(self.components())
    }

    /// Where `path` ends up when `from` is renamed to `to`.
    pub fn rebase(path: &str, from: &Path, to: &Path) -> Rebase {
        let Ok(path) = Path::parse(path) else {
            return Rebase::Unaffected;
        };
        let Some(rest) = path.comps.strip_prefix(from.components()) else {
            return Rebase::Unaffected;
        };
        let mut comps: Vec<&str, MAX_DEPTH> = Vec::new();
        for comp in to.components().iter().chain(rest.iter()).copied() {
            if comps.push(comp).is_err() {
                return Rebase::Lost;
            }
        }
        match join(&comps) {
            Ok(buf) => Rebase::Moved(buf),
            Err(_) => Rebase::Lost,
        }
    }
}

fn join(comps: &[&str]) -> Result<PathBuf> {
    let mut buf = PathBuf::new();
    if comps.is_empty() {
        buf.push('/').map_err(|_| Error::NameTooLong)?;
    }
    for comp in comps {
        buf.push('/').map_err(|_| Error::NameTooLong)?;
        buf.push_str(comp).map_err(|_| Error::NameTooLong)?;
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::quickcheck;
    use std::string::String;

    #[test]
    fn normalises_separators() {
        let path = Path::parse("//a/./b//").unwrap();
        assert_eq!(path.components(), &["a", "b"]);
        assert!(path.dir_hint());
        assert_eq!(path.to_buf().unwrap(), "/a/b");

        let path = Path::parse("a/b/../c").unwrap();
        assert_eq!(path.components(), &["a", "c"]);
        assert!(!path.dir_hint());
    }

    #[test]
    fn root_spellings() {
        for spelling in ["/", "//", "/.", ".", "/..", "a/.."] {
            let path = Path::parse(spelling).unwrap();
            assert!(path.is_root(), "{spelling}");
            assert!(!path.dir_hint());
            assert_eq!(path.to_buf().unwrap(), "/");
        }
    }

    #[test]
    fn rejects_malformed() {
        assert_eq!(Path::parse(""), Err(Error::Invalid));
        assert_eq!(Path::parse("/a\0b"), Err(Error::Invalid));

        let long = "x".repeat(NAME_MAX + 1);
        assert_eq!(Path::parse(&long), Err(Error::NameTooLong));
        assert_eq!(Path::parse("/1/2/3/4/5/6/7/8/9"), Err(Error::NameTooLong));
        assert!(Path::parse("/1/2/3/4/5/6/7/8").is_ok());
    }

    #[test]
    fn rebase_under_renamed_directory() {
        let from = Path::parse("/logs").unwrap();
        let to = Path::parse("/old/logs").unwrap();
        match Path::rebase("/logs/today.txt", &from, &to) {
            Rebase::Moved(buf) => assert_eq!(buf, "/old/logs/today.txt"),
            _ => panic!("not moved"),
        }
        assert!(matches!(
            Path::rebase("/logsbook", &from, &to),
            Rebase::Unaffected
        ));
    }

    quickcheck! {
        fn normalised_form_is_stable(comps: std::vec::Vec<u8>) -> bool {
            let mut raw = String::new();
            for c in comps.iter().take(MAX_DEPTH) {
                raw.push('/');
                raw.push(char::from(b'a' + c % 26));
            }
            if raw.is_empty() {
                raw.push('/');
            }
            let first = Path::parse(&raw).unwrap().to_buf().unwrap();
            let second = Path::parse(&first).unwrap().to_buf().unwrap();
            first == second && first.as_str() == raw
        }
    }
}
