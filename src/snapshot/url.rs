use std::path::PathBuf;

/// A backup URL parsed into a backend selector plus its locator fields.
///
/// Examples of accepted forms:
///   file:///var/lib/etcd-backups/   -> local directory
///   s3://bucket/backupdir/          -> bucket + key prefix
///   azure://host/container          -> storage account host + container
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupUrl {
    File { dir: PathBuf },
    S3 { bucket: String, prefix: String },
    Azure { account_host: String, container: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseBackupUrlError {
    InvalidScheme,
    UnsupportedScheme,
    InvalidDirectoryPath,
    HostEmpty,
    PathEmpty,
    CannotParse,
}

impl std::fmt::Display for ParseBackupUrlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidScheme => write!(f, "url does not specify a valid scheme"),
            Self::UnsupportedScheme => write!(f, "unsupported backup url scheme"),
            Self::InvalidDirectoryPath => write!(f, "path must be a directory"),
            Self::HostEmpty => write!(f, "host cannot be empty"),
            Self::PathEmpty => write!(f, "container path cannot be empty"),
            Self::CannotParse => write!(f, "cannot parse url"),
        }
    }
}

impl std::error::Error for ParseBackupUrlError {}

/// Deconstructs a backup URL into a backend locator.
///
/// Directory-like locators (file paths, s3 key prefixes) must be spelled with
/// a trailing slash so a file path is never silently treated as a directory.
pub fn parse_backup_url(s: &str) -> Result<BackupUrl, ParseBackupUrlError> {
    let scheme_end = s.find("://").ok_or(ParseBackupUrlError::InvalidScheme)?;
    let scheme = s[..scheme_end].to_ascii_lowercase();
    let rest = &s[scheme_end + 3..];

    match scheme.as_str() {
        "file" => {
            // The url crate normalizes an empty file path to "/", which would
            // defeat the trailing-slash check; test the raw input instead.
            if !s.ends_with('/') {
                return Err(ParseBackupUrlError::InvalidDirectoryPath);
            }
            let u = reqwest::Url::parse(s).map_err(|_| ParseBackupUrlError::CannotParse)?;
            let joined = format!("{}{}", u.host_str().unwrap_or(""), u.path());
            let mut dir = joined.as_str();
            while dir.len() > 1 && dir.ends_with('/') {
                dir = &dir[..dir.len() - 1];
            }
            Ok(BackupUrl::File {
                dir: PathBuf::from(dir),
            })
        }
        "s3" => {
            let u = reqwest::Url::parse(s).map_err(|_| ParseBackupUrlError::CannotParse)?;
            let prefix = u.path().trim_start_matches('/').to_string();
            if !prefix.is_empty() && !prefix.ends_with('/') {
                return Err(ParseBackupUrlError::InvalidDirectoryPath);
            }
            Ok(BackupUrl::S3 {
                bucket: u.host_str().unwrap_or("").to_string(),
                prefix,
            })
        }
        "azure" => {
            if rest.is_empty() || rest.starts_with('/') {
                return Err(ParseBackupUrlError::HostEmpty);
            }
            let u = reqwest::Url::parse(s).map_err(|_| ParseBackupUrlError::CannotParse)?;
            let account_host = match u.host_str() {
                Some(h) if !h.is_empty() => h.to_string(),
                _ => return Err(ParseBackupUrlError::HostEmpty),
            };
            let container = u
                .path()
                .trim_start_matches('/')
                .split('/')
                .next()
                .unwrap_or("")
                .to_string();
            if container.is_empty() {
                return Err(ParseBackupUrlError::PathEmpty);
            }
            Ok(BackupUrl::Azure {
                account_host,
                container,
            })
        }
        _ => Err(ParseBackupUrlError::UnsupportedScheme),
    }
}

impl std::fmt::Display for BackupUrl {
    /// Re-emits the canonical form of the URL this locator was parsed from.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File { dir } => {
                if dir == &PathBuf::from("/") {
                    write!(f, "file:///")
                } else {
                    write!(f, "file://{}/", dir.display())
                }
            }
            Self::S3 { bucket, prefix } => write!(f, "s3://{bucket}/{prefix}"),
            Self::Azure {
                account_host,
                container,
            } => write!(f, "azure://{account_host}/{container}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn file(dir: &str) -> BackupUrl {
        BackupUrl::File {
            dir: PathBuf::from(dir),
        }
    }

    fn s3(bucket: &str, prefix: &str) -> BackupUrl {
        BackupUrl::S3 {
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
        }
    }

    #[test]
    fn parses_and_rejects_the_boundary_table() {
        let cases: &[(&str, Result<BackupUrl, ParseBackupUrlError>)] = &[
            ("", Err(ParseBackupUrlError::InvalidScheme)),
            ("file:///", Ok(file("/"))),
            ("file://abc", Err(ParseBackupUrlError::InvalidDirectoryPath)),
            ("file://abc/", Ok(file("abc"))),
            ("file:///abc/", Ok(file("/abc"))),
            ("s3://abc/", Ok(s3("abc", ""))),
            ("s3://abc/backupdir/", Ok(s3("abc", "backupdir/"))),
            (
                "s3://abc/backupdir",
                Err(ParseBackupUrlError::InvalidDirectoryPath),
            ),
            ("azure://", Err(ParseBackupUrlError::HostEmpty)),
            ("azure://host/", Err(ParseBackupUrlError::PathEmpty)),
            ("azure://host", Err(ParseBackupUrlError::PathEmpty)),
            (
                "azure://host/container",
                Ok(BackupUrl::Azure {
                    account_host: "host".to_string(),
                    container: "container".to_string(),
                }),
            ),
            (
                "http://example.com/x",
                Err(ParseBackupUrlError::UnsupportedScheme),
            ),
            ("gs://abc/", Err(ParseBackupUrlError::UnsupportedScheme)),
            ("notaurl", Err(ParseBackupUrlError::InvalidScheme)),
        ];
        for (input, expected) in cases {
            assert_eq!(&parse_backup_url(input), expected, "input: {input:?}");
        }
    }

    #[test]
    fn schemes_are_case_insensitive() {
        assert_eq!(parse_backup_url("S3://abc/"), Ok(s3("abc", "")));
        assert_eq!(parse_backup_url("FILE:///abc/"), Ok(file("/abc")));
    }

    #[test]
    fn canonical_form_reparses_to_the_same_locator() {
        let inputs = [
            "file:///",
            "file://abc/",
            "file:///var/lib/backups/",
            "s3://bucket/",
            "s3://bucket/backupdir/",
            "s3://bucket/a/b/",
            "azure://mystorage.blob.core.windows.net/snaps",
        ];
        for input in inputs {
            let parsed = parse_backup_url(input).unwrap();
            let reparsed = parse_backup_url(&parsed.to_string()).unwrap();
            assert_eq!(parsed, reparsed, "input: {input:?}");
        }
    }

    #[test]
    fn equivalent_spellings_map_to_the_same_locator() {
        // Extra trailing slashes collapse for file paths; an s3 prefix keeps
        // exactly one.
        assert_eq!(
            parse_backup_url("file:///abc//").unwrap(),
            parse_backup_url("file:///abc/").unwrap()
        );
    }
}
