//! Legacy XML registry reader.
//!
//! Older profiles stored the registry as:
//!
//! ```xml
//! <UserScriptConfig>
//!   <Script id="..." name="..." filename="a.user.js" enabled="true" runAt="document-end">
//!     <Include>http://example.com/*</Include>
//!     <Exclude>http://example.com/private/*</Exclude>
//!   </Script>
//!   <Exclude>http://bank.example/*</Exclude>
//! </UserScriptConfig>
//! ```
//!
//! XML is only ever read; a successful read is always followed by a JSON save.

use std::collections::HashMap;
use std::fmt::Display;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::warn;

use super::{RunAt, Script, ScriptId};
use crate::error::{KeeperError, KeeperResult};
use crate::pattern::{MatchPattern, Pattern};

/// Contents of a legacy XML registry.
#[derive(Debug, Default)]
pub struct LegacyRegistry {
    pub scripts: Vec<Script>,
    pub excludes: Vec<Pattern>,
}

#[derive(Debug, Clone, Copy)]
enum TextTarget {
    Include,
    Exclude,
    Match,
    RegistryExclude,
}

fn xml_err(e: impl Display) -> KeeperError {
    KeeperError::parse("XML registry", e)
}

fn script_from_attributes(element: &BytesStart) -> KeeperResult<Script> {
    let mut attrs: HashMap<String, String> = HashMap::new();
    for attr in element.attributes() {
        let attr = attr.map_err(xml_err)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value().map_err(xml_err)?.into_owned();
        attrs.insert(key, value);
    }

    let mut take = |key: &str| attrs.remove(key).filter(|v| !v.is_empty());
    let flag = |value: Option<String>| value.is_some_and(|v| v == "true");

    let name = take("name").ok_or_else(|| xml_err("Script element without a name"))?;
    let filename = take("filename").ok_or_else(|| xml_err("Script element without a filename"))?;
    let namespace = take("namespace").unwrap_or_default();
    let id = take("id").unwrap_or_else(|| format!("{}@{}", name, namespace));

    Ok(Script {
        id: ScriptId::new(id),
        name,
        namespace,
        description: take("description").unwrap_or_default(),
        version: take("version"),
        filename,
        enabled: flag(take("enabled")),
        priority: take("priority")
            .and_then(|p| p.parse().ok())
            .unwrap_or_default(),
        includes: Vec::new(),
        excludes: Vec::new(),
        matches: Vec::new(),
        run_at: take("runAt")
            .and_then(|r| r.parse().ok())
            .unwrap_or(RunAt::DocumentEnd),
        delay_ms: take("delay").and_then(|d| d.parse().ok()),
        top_level_only: flag(take("noframes")),
        source_digest: take("sourceDigest").unwrap_or_default(),
        download_url: take("downloadURL"),
        update_url: take("updateURL"),
        blocked: flag(take("blocked")),
        needs_uninstall: false,
        enabled_before_uninstall: None,
        catalog: None,
    })
}

/// Add one pattern to the script or registry being read.
///
/// Patterns that do not compile are skipped. Returns `false` when the
/// current script has to be skipped too, i.e. one of its excludes was lost.
fn apply_text(
    target: TextTarget,
    text: &str,
    script: Option<&mut Script>,
    registry: &mut LegacyRegistry,
) -> bool {
    let added = match (target, script) {
        (TextTarget::Include, Some(script)) => {
            Pattern::compile(text).map(|p| script.includes.push(p))
        }
        (TextTarget::Exclude, Some(script)) => {
            Pattern::compile(text).map(|p| script.excludes.push(p))
        }
        (TextTarget::Match, Some(script)) => {
            MatchPattern::compile(text).map(|p| script.matches.push(p))
        }
        (TextTarget::RegistryExclude, _) => {
            Pattern::compile(text).map(|p| registry.excludes.push(p))
        }
        _ => Ok(()),
    };

    match added {
        Ok(()) => true,
        Err(e) => {
            warn!(pattern = text, "Skipping pattern from XML registry: {}", e);
            !matches!(target, TextTarget::Exclude)
        }
    }
}

/// Parse a legacy XML registry document.
pub fn parse(xml: &str) -> KeeperResult<LegacyRegistry> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut registry = LegacyRegistry::default();
    let mut current: Option<Script> = None;
    let mut skip_current = false;
    let mut target: Option<TextTarget> = None;
    let mut saw_root = false;

    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(element) => match element.name().as_ref() {
                b"UserScriptConfig" => saw_root = true,
                b"Script" if saw_root => {
                    current = Some(script_from_attributes(&element)?);
                    skip_current = false;
                }
                b"Include" => target = Some(TextTarget::Include),
                b"Match" => target = Some(TextTarget::Match),
                b"Exclude" if current.is_some() => target = Some(TextTarget::Exclude),
                b"Exclude" if saw_root => target = Some(TextTarget::RegistryExclude),
                _ => {}
            },
            Event::Empty(element) => match element.name().as_ref() {
                b"UserScriptConfig" => saw_root = true,
                b"Script" if saw_root => registry.scripts.push(script_from_attributes(&element)?),
                _ => {}
            },
            Event::Text(text) => {
                if let Some(target) = target {
                    let text = text.unescape().map_err(xml_err)?;
                    let text = text.trim();
                    if !text.is_empty() {
                        let kept = apply_text(target, text, current.as_mut(), &mut registry);
                        skip_current |= !kept;
                    }
                }
            }
            Event::End(element) => match element.name().as_ref() {
                b"Script" => match current.take() {
                    Some(script) if skip_current => {
                        warn!(script = %script.id, "Skipping script with an unusable exclude");
                    }
                    Some(script) => registry.scripts.push(script),
                    None => {}
                },
                b"Include" | b"Exclude" | b"Match" => target = None,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_root {
        return Err(xml_err("missing UserScriptConfig root element"));
    }
    if current.is_some() {
        return Err(xml_err("unterminated Script element"));
    }

    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_script_and_exclude() {
        let xml = r#"<?xml version="1.0"?>
<UserScriptConfig>
  <Script id="s1" name="First" namespace="ns" filename="first.user.js" enabled="true"
          priority="3" runAt="document-idle" delay="100" noframes="true"
          downloadURL="http://userscripts.org/scripts/source/1.user.js">
    <Include>http://example.com/*</Include>
    <Exclude>http://example.com/x*</Exclude>
    <Match>*://*.example.org/*</Match>
  </Script>
  <Exclude>http://bank.example/*</Exclude>
</UserScriptConfig>"#;

        let registry = parse(xml).unwrap();
        assert_eq!(registry.scripts.len(), 1);
        assert_eq!(registry.excludes.len(), 1);
        assert_eq!(registry.excludes[0].as_str(), "http://bank.example/*");

        let script = &registry.scripts[0];
        assert_eq!(script.id.as_str(), "s1");
        assert_eq!(script.filename, "first.user.js");
        assert!(script.enabled);
        assert_eq!(script.priority, 3);
        assert_eq!(script.run_at, RunAt::DocumentIdle);
        assert_eq!(script.delay_ms, Some(100));
        assert!(script.top_level_only);
        assert_eq!(script.includes.len(), 1);
        assert_eq!(script.excludes.len(), 1);
        assert_eq!(script.matches.len(), 1);
        assert!(script.is_uso_script());
    }

    #[test]
    fn test_defaults_for_missing_attributes() {
        let xml = r#"<UserScriptConfig><Script name="A" filename="a.user.js"/></UserScriptConfig>"#;
        let registry = parse(xml).unwrap();
        let script = &registry.scripts[0];
        assert_eq!(script.id.as_str(), "A@");
        assert!(!script.enabled);
        assert_eq!(script.run_at, RunAt::DocumentEnd);
    }

    #[test]
    fn test_malformed_documents() {
        assert!(parse("").is_err());
        assert!(parse("<Other/>").is_err());
        assert!(parse(r#"<UserScriptConfig><Script filename="a"/></UserScriptConfig>"#).is_err());
        assert!(parse("<UserScriptConfig><Script name=\"A\" filename=\"a\">").is_err());
    }

    #[test]
    fn test_bad_patterns_do_not_sink_the_registry() {
        let xml = r#"<UserScriptConfig>
  <Script name="Kept" filename="kept.user.js" enabled="true">
    <Include>/^https?://(?!ads)/</Include>
    <Include>http://example.com/*</Include>
  </Script>
  <Script name="Other" filename="other.user.js" enabled="true">
    <Include>http://example.org/*</Include>
  </Script>
  <Script name="Dropped" filename="dropped.user.js" enabled="true">
    <Include>*</Include>
    <Exclude>/(?&lt;=x)y/</Exclude>
  </Script>
  <Exclude>http://bank.example/*</Exclude>
</UserScriptConfig>"#;

        let registry = parse(xml).unwrap();
        let names: Vec<_> = registry.scripts.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Kept", "Other"]);
        assert_eq!(registry.scripts[0].includes.len(), 1);
        assert!(registry.scripts[0].matches_url("http://example.com/page"));
        assert_eq!(registry.excludes.len(), 1);
    }
}
