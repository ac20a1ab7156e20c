//! Upstream tag parsing and version policy.
//!
//! Tags are free-form (`v3.24.43`, `cairo-1.18.0`, `GTK_2_24_33`); the
//! version is read from the first digit onwards, `_` is treated as `.`, and
//! missing minor/patch components are padded with zero for comparison.

use semver::Version;

use crate::recipe::VersionPolicy;

/// A tag that parsed as a version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagVersion {
  pub tag: String,
  /// Version text as written in the tag (`3.24`, not `3.24.0`).
  pub version: String,
  pub semver: Version,
}

/// Parse a tag (with or without a `refs/tags/` prefix).
pub fn parse_tag(tag: &str) -> Option<TagVersion> {
  let short = tag.strip_prefix("refs/tags/").unwrap_or(tag);
  let start = short.find(|c: char| c.is_ascii_digit())?;
  let text = short[start..].replace('_', ".");
  let semver = parse_version(&text)?;

  Some(TagVersion {
    tag: short.to_string(),
    version: text,
    semver,
  })
}

/// Parse a dotted version with one to three numeric components and an
/// optional `-prerelease` suffix.
pub fn parse_version(text: &str) -> Option<Version> {
  let (core, pre) = match text.split_once('-') {
    Some((core, pre)) => (core, Some(pre)),
    None => (text, None),
  };

  let parts: Vec<&str> = core.split('.').collect();
  if parts.is_empty() || parts.len() > 3 || parts.iter().any(|p| p.is_empty() || !p.bytes().all(|b| b.is_ascii_digit())) {
    return None;
  }

  let mut padded = parts.join(".");
  for _ in parts.len()..3 {
    padded.push_str(".0");
  }
  if let Some(pre) = pre {
    padded.push('-');
    padded.push_str(pre);
  }

  Version::parse(&padded).ok()
}

impl VersionPolicy {
  pub fn admits(&self, version: &Version) -> bool {
    if !self.allow_prerelease && !version.pre.is_empty() {
      return false;
    }
    if self.even_minor && version.minor % 2 != 0 {
      return false;
    }
    if let Some(max) = self.max_major
      && version.major > max
    {
      return false;
    }
    true
  }
}

/// Highest version among `tags` admitted by `policy`.
///
/// Ties between tags naming the same version (`1.2` and `1.2.0`) go to the
/// lexicographically greater tag so the choice does not depend on listing order.
pub fn select_latest<'a>(tags: impl IntoIterator<Item = &'a str>, policy: &VersionPolicy) -> Option<TagVersion> {
  tags
    .into_iter()
    .filter_map(parse_tag)
    .filter(|t| policy.admits(&t.semver))
    .max_by(|a, b| a.semver.cmp(&b.semver).then_with(|| a.tag.cmp(&b.tag)))
}

/// The tag for a pinned version: an exact tag name wins, then `v<version>`,
/// then any tag whose parsed version equals it.
pub fn find_pinned<'a>(tags: impl IntoIterator<Item = &'a str>, version: &str) -> Option<String> {
  let tags: Vec<&str> = tags.into_iter().map(|t| t.strip_prefix("refs/tags/").unwrap_or(t)).collect();

  if let Some(tag) = tags.iter().find(|t| **t == version) {
    return Some(tag.to_string());
  }
  let prefixed = format!("v{version}");
  if let Some(tag) = tags.iter().find(|t| **t == prefixed) {
    return Some(tag.to_string());
  }

  let wanted = parse_version(version)?;
  let mut matching: Vec<&str> = tags
    .into_iter()
    .filter(|t| parse_tag(t).is_some_and(|p| p.semver == wanted))
    .collect();
  matching.sort_unstable();
  matching.last().map(|t| t.to_string())
}

/// Versions in `tags` newer than `current` and admitted by `policy`, ascending.
pub fn newer_than<'a>(current: &str, tags: impl IntoIterator<Item = &'a str>, policy: &VersionPolicy) -> Vec<TagVersion> {
  let Some(current) = parse_version(current) else {
    return Vec::new();
  };
  let mut newer: Vec<TagVersion> = tags
    .into_iter()
    .filter_map(parse_tag)
    .filter(|t| t.semver > current && policy.admits(&t.semver))
    .collect();
  newer.sort_by(|a, b| a.semver.cmp(&b.semver).then_with(|| a.tag.cmp(&b.tag)));
  newer.dedup_by(|a, b| a.semver == b.semver);
  newer
}
