//! Boot environment.
//!
//! The loader hands the kernel a flattened argument vector of `key=value`
//! strings. Values may be quoted to protect embedded whitespace, e.g.
//! `init="/bin/sh -l"`. Keys consumed by the core: `memsize`, `rd_start`,
//! `rd_size`, `mem_start`, `mem_end`, `init`, `test`, `klog-mask`,
//! `klog-quiet`, `klog-verbose`, `seed`.

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use hashbrown::HashMap;
use once_cell::race::OnceBox;
use spinning_top::Spinlock;

static KENV: OnceBox<Spinlock<HashMap<String, String>>> = OnceBox::new();

fn kenv() -> &'static Spinlock<HashMap<String, String>> {
    KENV.get_or_init(|| alloc::boxed::Box::new(Spinlock::new(HashMap::new())))
}

/// Split a raw command line into whitespace-separated tokens.
///
/// A double-quoted span protects whitespace; the quotes themselves are not
/// part of the token. `a="b c" d` yields `a=b c` and `d`.
pub fn tokenize(cmdline: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut cur = String::new();
    let mut in_quotes = false;
    for ch in cmdline.chars() {
        match ch {
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                if !cur.is_empty() {
                    tokens.push(core::mem::take(&mut cur));
                }
            }
            c => cur.push(c),
        }
    }
    if !cur.is_empty() {
        tokens.push(cur);
    }
    tokens
}

/// Record the boot arguments. Tokens without `=` are stored with an empty
/// value so that flag-style keys can be tested with [`has`].
pub fn init(args: &[&str]) {
    let mut map = kenv().lock();
    for arg in args {
        match arg.split_once('=') {
            Some((key, value)) => map.insert(key.to_string(), value.to_string()),
            None => map.insert(arg.to_string(), String::new()),
        };
    }
}

/// Parse and record a raw command line (applies [`tokenize`] first).
pub fn init_cmdline(cmdline: &str) {
    let mut map = kenv().lock();
    for token in tokenize(cmdline) {
        match token.split_once('=') {
            Some((key, value)) => map.insert(key.to_string(), value.to_string()),
            None => map.insert(token, String::new()),
        };
    }
}

/// Fetch the value bound to `key`.
pub fn get(key: &str) -> Option<String> {
    kenv().lock().get(key).cloned()
}

/// True if `key` was present on the command line, with or without a value.
pub fn has(key: &str) -> bool {
    kenv().lock().contains_key(key)
}

/// Fetch `key` and parse it as an integer. Accepts a `0x` prefix.
pub fn get_uint(key: &str) -> Option<usize> {
    let value = get(key)?;
    let value = value.trim();
    if let Some(hex) = value.strip_prefix("0x") {
        usize::from_str_radix(hex, 16).ok()
    } else {
        value.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_splits_on_whitespace() {
        let tokens = tokenize("memsize=0x1000000  test=all\tklog-quiet");
        assert_eq!(tokens, ["memsize=0x1000000", "test=all", "klog-quiet"]);
    }

    #[test]
    fn tokenize_honors_quotes() {
        let tokens = tokenize(r#"init="/bin/sh -l" seed=123"#);
        assert_eq!(tokens, ["init=/bin/sh -l", "seed=123"]);
    }

    #[test]
    fn quoted_value_survives_roundtrip() {
        init_cmdline(r#"kenv-test-init="/bin/utest arg" kenv-test-mem=0x40"#);
        assert_eq!(get("kenv-test-init").as_deref(), Some("/bin/utest arg"));
        assert_eq!(get_uint("kenv-test-mem"), Some(0x40));
        assert!(!has("kenv-test-absent"));
    }
}
