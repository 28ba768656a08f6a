//! Build settings the shipped binary depends on.
//!
//! Worker handler panics are caught with `catch_unwind`, which only works
//! when the profile unwinds. Test builds always unwind, so the release
//! profile is checked directly.

const WORKSPACE_MANIFEST: &str = include_str!("../../../Cargo.toml");

fn profile(name: &str) -> &'static str {
    let header = format!("[profile.{name}]");
    let start = WORKSPACE_MANIFEST.find(&header).unwrap() + header.len();
    let body = &WORKSPACE_MANIFEST[start..];
    body.find("\n[").map_or(body, |end| &body[..end])
}

fn setting<'a>(profile: &'a str, key: &str) -> Option<&'a str> {
    profile.lines().find_map(|line| {
        let (name, value) = line.split_once('=')?;
        (name.trim() == key).then(|| value.trim().trim_matches('"'))
    })
}

#[test]
fn release_profile_unwinds_so_handler_panics_are_caught() {
    assert_eq!(setting(profile("release"), "panic"), Some("unwind"));
}

#[test]
fn bench_profile_inherits_release_panic_strategy() {
    let bench = profile("bench");
    assert_eq!(setting(bench, "inherits"), Some("release"));
    assert_eq!(setting(bench, "panic"), None);
}
