//! Device parameter intake
//!
//! Parameters arrive as a comma or newline separated list of `key=value`
//! tokens, e.g. `dev_name=/srv/lun0.img,dev_size=0x40000000`. Tokens with an
//! unknown key are ignored so newer configuration can be fed to older
//! backends.

use crate::error::{FileIoError, FileIoResult};
use bitflags::bitflags;
use std::path::Path;

/// Maximum backing path length, including the terminator slot
pub const FD_MAX_DEV_NAME: usize = 256;

bitflags! {
    /// Which required parameters have been supplied
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FdFlags: u32 {
        const HAS_PATH = 0x01;
        const HAS_SIZE = 0x02;
    }
}

impl Default for FdFlags {
    fn default() -> Self {
        FdFlags::empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    DevName,
    DevSize,
}

fn match_token(key: &str) -> Option<Token> {
    match key {
        "dev_name" | "fd_dev_name" => Some(Token::DevName),
        "dev_size" | "fd_dev_size" => Some(Token::DevSize),
        _ => None,
    }
}

/// Configured parameters of one FILEIO device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FdParams {
    dev_name: String,
    dev_size: u64,
    flags: FdFlags,
}

impl FdParams {
    pub fn dev_name(&self) -> Option<&Path> {
        if self.flags.contains(FdFlags::HAS_PATH) {
            Some(Path::new(&self.dev_name))
        } else {
            None
        }
    }

    /// Declared size in bytes, if `dev_size=` was supplied
    pub fn dev_size(&self) -> Option<u64> {
        if self.flags.contains(FdFlags::HAS_SIZE) {
            Some(self.dev_size)
        } else {
            None
        }
    }

    pub fn flags(&self) -> FdFlags {
        self.flags
    }

    /// Apply a parameter string
    ///
    /// Returns the number of bytes consumed. The first malformed value aborts
    /// the call; values applied by earlier tokens stay in place.
    pub fn apply(&mut self, page: &str) -> FileIoResult<usize> {
        for ptr in page.split([',', '\n']) {
            if ptr.is_empty() {
                continue;
            }

            let Some((key, arg)) = ptr.split_once('=') else {
                continue;
            };

            match match_token(key) {
                Some(Token::DevName) => {
                    if arg.is_empty() {
                        return Err(FileIoError::Parse("empty dev_name=".into()));
                    }
                    if arg.len() >= FD_MAX_DEV_NAME {
                        return Err(FileIoError::Parse(format!(
                            "dev_name= is {} bytes, limit is {}",
                            arg.len(),
                            FD_MAX_DEV_NAME - 1
                        )));
                    }
                    self.dev_name = arg.to_string();
                    self.flags.insert(FdFlags::HAS_PATH);
                    log::debug!("FILEIO: Referencing Path: {}", self.dev_name);
                }
                Some(Token::DevSize) => {
                    self.dev_size = parse_u64_literal(arg).map_err(|e| {
                        log::error!("FILEIO: invalid dev_size={}: {}", arg, e);
                        e
                    })?;
                    self.flags.insert(FdFlags::HAS_SIZE);
                    log::debug!("FILEIO: Referencing Size: {} bytes", self.dev_size);
                }
                None => {}
            }
        }

        Ok(page.len())
    }

    /// Check that the parameters required for activation are present
    pub fn validate(&self) -> FileIoResult<()> {
        if !self.flags.contains(FdFlags::HAS_PATH) {
            log::error!("Missing dev_name=");
            return Err(FileIoError::Validation("missing dev_name=".into()));
        }
        Ok(())
    }

    /// Render the diagnostic status line
    pub(crate) fn render(&self, dev_id: u32, size: u64) -> String {
        format!(
            "FILEIO ID: {}        File: {}  Size: {}  Mode: O_DSYNC\n",
            dev_id, self.dev_name, size
        )
    }
}

/// Parse an unsigned 64-bit literal using C base-0 rules
///
/// `0x`/`0X` selects hexadecimal, a leading `0` octal, anything else decimal.
/// A single leading `+` is accepted.
pub fn parse_u64_literal(text: &str) -> FileIoResult<u64> {
    let invalid = || FileIoError::Parse(format!("invalid numeric literal {:?}", text));

    let digits = text.strip_prefix('+').unwrap_or(text);
    let (radix, digits) = if let Some(hex) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        (16, hex)
    } else if digits.len() > 1 && digits.starts_with('0') {
        (8, &digits[1..])
    } else {
        (10, digits)
    };

    if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix)) {
        return Err(invalid());
    }

    u64::from_str_radix(digits, radix).map_err(|_| invalid())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_name_and_size() {
        let mut params = FdParams::default();
        let page = "dev_name=/tmp/x,dev_size=1048576";
        assert_eq!(params.apply(page).unwrap(), page.len());
        assert_eq!(params.dev_name(), Some(Path::new("/tmp/x")));
        assert_eq!(params.dev_size(), Some(1048576));
        assert!(params.flags().contains(FdFlags::HAS_PATH));
        assert!(params.flags().contains(FdFlags::HAS_SIZE));
        assert_eq!(params.flags().bits(), 0x03);
    }

    #[test]
    fn test_flags_start_empty_and_reject_unknown_bits() {
        let params = FdParams::default();
        assert!(params.flags().is_empty());
        assert_eq!(params.flags(), FdFlags::empty());
        assert_eq!(FdFlags::from_bits(0x03), Some(FdFlags::all()));
        assert_eq!(FdFlags::from_bits(0x04), None);
    }

    #[test]
    fn test_newline_separated_and_empty_tokens() {
        let mut params = FdParams::default();
        params.apply("\n,dev_name=/dev/sdb\n\n").unwrap();
        assert_eq!(params.dev_name(), Some(Path::new("/dev/sdb")));
        assert_eq!(params.dev_size(), None);
    }

    #[test]
    fn test_legacy_keys() {
        let mut params = FdParams::default();
        params.apply("fd_dev_name=/a,fd_dev_size=0x200").unwrap();
        assert_eq!(params.dev_name(), Some(Path::new("/a")));
        assert_eq!(params.dev_size(), Some(512));
    }

    #[test]
    fn test_unknown_tokens_ignored() {
        let mut params = FdParams::default();
        params
            .apply("buffered_io=1,dev_name=/a,garbage,readonly=yes")
            .unwrap();
        assert_eq!(params.dev_name(), Some(Path::new("/a")));
    }

    #[test]
    fn test_bad_size_aborts_but_keeps_earlier_tokens() {
        let mut params = FdParams::default();
        let err = params
            .apply("dev_name=/a,dev_size=12abc,dev_name=/b")
            .unwrap_err();
        assert!(matches!(err, FileIoError::Parse(_)));
        assert_eq!(params.dev_name(), Some(Path::new("/a")));
        assert_eq!(params.dev_size(), None);
    }

    #[test]
    fn test_name_too_long() {
        let mut params = FdParams::default();
        let long = format!("dev_name={}", "a".repeat(FD_MAX_DEV_NAME));
        assert!(matches!(params.apply(&long), Err(FileIoError::Parse(_))));
        assert!(!params.flags().contains(FdFlags::HAS_PATH));

        let fits = format!("dev_name={}", "a".repeat(FD_MAX_DEV_NAME - 1));
        params.apply(&fits).unwrap();
        assert!(params.flags().contains(FdFlags::HAS_PATH));
    }

    #[test]
    fn test_empty_name_rejected() {
        let mut params = FdParams::default();
        assert!(params.apply("dev_name=").is_err());
    }

    #[test]
    fn test_validate_requires_path_only() {
        let mut params = FdParams::default();
        assert!(params.validate().is_err());

        params.apply("dev_size=4096").unwrap();
        assert!(params.validate().is_err());

        params.apply("dev_name=/dev/sdc").unwrap();
        assert!(params.validate().is_ok());

        let mut path_only = FdParams::default();
        path_only.apply("dev_name=/dev/sdc").unwrap();
        assert!(path_only.validate().is_ok());
    }

    #[test]
    fn test_parse_literals() {
        assert_eq!(parse_u64_literal("1048576").unwrap(), 1048576);
        assert_eq!(parse_u64_literal("0x100000").unwrap(), 0x100000);
        assert_eq!(parse_u64_literal("0X1f").unwrap(), 31);
        assert_eq!(parse_u64_literal("0755").unwrap(), 0o755);
        assert_eq!(parse_u64_literal("0").unwrap(), 0);
        assert_eq!(parse_u64_literal("+42").unwrap(), 42);
        assert_eq!(parse_u64_literal("18446744073709551615").unwrap(), u64::MAX);

        assert!(parse_u64_literal("").is_err());
        assert!(parse_u64_literal("0x").is_err());
        assert!(parse_u64_literal("-1").is_err());
        assert!(parse_u64_literal("++1").is_err());
        assert!(parse_u64_literal("089").is_err());
        assert!(parse_u64_literal("18446744073709551616").is_err());
        assert!(parse_u64_literal("10 ").is_err());
    }

    #[test]
    fn test_render_contains_path() {
        let mut params = FdParams::default();
        params.apply("dev_name=/srv/lun0.img,dev_size=8192").unwrap();
        let line = params.render(3, 8192);
        assert_eq!(
            line,
            "FILEIO ID: 3        File: /srv/lun0.img  Size: 8192  Mode: O_DSYNC\n"
        );
    }
}
