use std::path::{Path, PathBuf};

/// Number of hex digits kept in a short commit hash.
pub const SHORT_SHA_LEN: usize = 7;

pub fn short_sha(sha: &str) -> &str { sha.get(..SHORT_SHA_LEN).unwrap_or(sha) }

pub fn repo_id(owner: &str, name: &str) -> String { format!("{owner}_{name}") }

pub fn commit_id(owner: &str, repo: &str, sha: &str) -> String {
    format!("{}_{}", repo_id(owner, repo), short_sha(sha))
}

/// Accepts `xx`, `xxx` and `xx-REGION` style codes.
pub fn is_valid_language(code: &str) -> bool {
    let (lang, region) = match code.split_once('-') {
        Some((lang, region)) => (lang, Some(region)),
        None => (code, None),
    };
    let lang_ok = (2..=3).contains(&lang.len()) && lang.bytes().all(|b| b.is_ascii_lowercase());
    let region_ok = region.is_none_or(|r| {
        (2..=8).contains(&r.len()) && r.bytes().all(|b| b.is_ascii_alphanumeric())
    });
    lang_ok && region_ok
}

/// Resolve the language set for a pipeline run.
///
/// Codes are trimmed, lower-cased and de-duplicated in order. An empty or
/// missing request falls back to `configured`. The default language is always
/// present and always first.
pub fn normalize_languages(
    requested: Option<&[String]>,
    configured: &[String],
    default_language: &str,
) -> Result<Vec<String>, String> {
    let source = match requested {
        Some(list) if list.iter().any(|l| !l.trim().is_empty()) => list,
        _ => configured,
    };
    let default_language = default_language.trim().to_ascii_lowercase();
    let mut out = vec![default_language];
    for code in source {
        let code = code.trim().to_ascii_lowercase();
        if code.is_empty() {
            continue;
        }
        if !is_valid_language(&code) {
            return Err(format!("invalid language code '{code}'"));
        }
        if !out.contains(&code) {
            out.push(code);
        }
    }
    Ok(out)
}

/// Join two paths, only including the normal components.
pub fn join_normalized(base: impl AsRef<Path>, path: impl AsRef<Path>) -> PathBuf {
    let mut out = base.as_ref().to_path_buf();
    out.extend(path.as_ref().components().filter(|v| matches!(v, std::path::Component::Normal(_))));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn langs(v: &[&str]) -> Vec<String> { v.iter().map(|s| s.to_string()).collect() }

    #[test]
    fn test_normalize_languages() {
        let configured = langs(&["en"]);
        let cases: &[(Option<&[&str]>, &[&str])] = &[
            (None, &["en"]),
            (Some(&[]), &["en"]),
            (Some(&[" ", ""]), &["en"]),
            (Some(&["es"]), &["en", "es"]),
            (Some(&["ES", "en", "es", "fr "]), &["en", "es", "fr"]),
            (Some(&["pt-br"]), &["en", "pt-br"]),
        ];
        for &(requested, expected) in cases {
            let requested = requested.map(langs);
            let result = normalize_languages(requested.as_deref(), &configured, "en").unwrap();
            assert_eq!(result, langs(expected), "requested {:?}", requested);
        }
    }

    #[test]
    fn test_normalize_languages_rejects_garbage() {
        let configured = langs(&["en"]);
        for bad in ["english!", "e", "12", "en_US"] {
            let requested = langs(&[bad]);
            assert!(normalize_languages(Some(&requested), &configured, "en").is_err(), "{bad}");
        }
    }

    #[test]
    fn test_join_normalized_stays_inside_base() {
        assert_eq!(
            join_normalized("/media", "../../etc/passwd"),
            PathBuf::from("/media/etc/passwd")
        );
        assert_eq!(
            join_normalized("/media", "videos/a/base.mp4"),
            PathBuf::from("/media/videos/a/base.mp4")
        );
    }

    #[test]
    fn test_commit_id() {
        assert_eq!(commit_id("octo", "repo", "abc1234567890"), "octo_repo_abc1234");
        assert_eq!(commit_id("octo", "repo", "abc"), "octo_repo_abc");
    }
}
