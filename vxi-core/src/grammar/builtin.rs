//! Builtin grammar URIs: `digits?minlength=1;maxlength=4`, `boolean?y=1;n=2`,
//! `text`. The `builtin:dtmf/`, `builtin:voice/` and `builtin:grammar/`
//! prefixes are accepted and ignored.

use super::GrammarKind;
use crate::error::{Result, VxiError};

pub fn parse_builtin(uri: &str) -> Result<GrammarKind> {
    let uri = uri.trim();
    let bare = ["builtin:dtmf/", "builtin:voice/", "builtin:grammar/", "builtin:"]
        .iter()
        .find_map(|p| uri.strip_prefix(p))
        .unwrap_or(uri);
    let (name, query) = bare.split_once('?').unwrap_or((bare, ""));
    let params: Vec<(&str, &str)> = query
        .split(';')
        .filter(|p| !p.is_empty())
        .filter_map(|p| p.split_once('='))
        .map(|(k, v)| (k.trim(), v.trim()))
        .collect();
    let param = |key: &str| params.iter().find(|(k, _)| *k == key).map(|(_, v)| *v);

    match name {
        "digits" => {
            let number = |key: &str| -> Result<Option<usize>> {
                param(key)
                    .map(|v| {
                        v.parse::<usize>()
                            .map_err(|_| VxiError::Semantic(format!("bad {key}={v} in {uri}")))
                    })
                    .transpose()
            };
            let exact = number("length")?;
            let min = exact.or(number("minlength")?).unwrap_or(1).max(1);
            let max = exact.or(number("maxlength")?);
            if max.map_or(false, |m| m < min) {
                return Err(VxiError::Semantic(format!(
                    "maxlength below minlength in {uri}"
                )));
            }
            Ok(GrammarKind::Digits { min, max })
        }
        "boolean" => {
            let symbols = |key: &str, default: char| -> Vec<char> {
                match param(key) {
                    Some(v) => v.chars().filter(|c| !c.is_whitespace() && *c != ',').collect(),
                    None => vec![default],
                }
            };
            let yes = symbols("y", '1');
            let no = symbols("n", '2');
            if yes.iter().any(|c| no.contains(c)) {
                return Err(VxiError::Semantic(format!(
                    "boolean yes/no symbols overlap in {uri}"
                )));
            }
            Ok(GrammarKind::Boolean { yes, no })
        }
        "text" => Ok(GrammarKind::Text),
        other => Err(VxiError::unsupported(
            "builtin",
            format!("no builtin grammar named '{other}'"),
        )),
    }
}
