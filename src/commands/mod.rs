use std::collections::BTreeMap;

use anyhow::anyhow;

use crate::error::AbcError;

pub mod render;
pub mod upgrade;

/// Parse repeated `--input KEY=VALUE` flags into a map. Later flags win.
pub(crate) fn parse_kv(flags: &[String]) -> Result<BTreeMap<String, String>, AbcError> {
    let mut map = BTreeMap::new();
    for flag in flags {
        let (k, v) = flag
            .split_once('=')
            .ok_or_else(|| anyhow!("--input expects KEY=VALUE, got {flag:?}"))?;
        map.insert(k.to_string(), v.to_string());
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kv() {
        let map = parse_kv(&["a=1".into(), "b=x=y".into(), "a=2".into()]).unwrap();
        assert_eq!(map["a"], "2");
        assert_eq!(map["b"], "x=y");
    }

    #[test]
    fn test_parse_kv_rejects_bare_key() {
        assert!(parse_kv(&["oops".into()]).is_err());
    }
}
