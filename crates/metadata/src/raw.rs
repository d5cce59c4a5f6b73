use std::collections::BTreeMap;

/// One tag value as the parser hands it over. Formats disagree on shape:
/// Vorbis comments repeat keys, MP4 stores numbers natively, ID3v2 comment
/// and lyrics frames carry a language and a descriptor.
#[derive(Clone, Debug, PartialEq)]
pub enum TagValue {
    Text(String),
    List(Vec<String>),
    Number(i64),
    Described {
        language: Option<String>,
        description: String,
        text: String,
    },
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AudioProperties {
    pub duration_ms: Option<u32>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u8>,
    pub bitrate: Option<u32>,
    pub has_embedded_cover: bool,
}

/// Tag dictionary keyed by lowercase canonical names (`title`, `albumartist`,
/// `tracknumber`, ...), plus stream properties.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawTags {
    pub tags: BTreeMap<String, TagValue>,
    pub properties: AudioProperties,
}

impl RawTags {
    /// Adds a value; a repeated key turns the entry into a list.
    pub fn insert(&mut self, key: impl Into<String>, value: TagValue) {
        let key = key.into();
        match self.tags.remove(&key) {
            None => {
                self.tags.insert(key, value);
            }
            Some(existing) => {
                let mut items = into_items(existing);
                items.extend(into_items(value));
                self.tags.insert(key, TagValue::List(items));
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&TagValue> {
        self.tags.get(key)
    }

    pub fn with_text(mut self, key: &str, value: &str) -> Self {
        self.insert(key, TagValue::Text(value.to_string()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

fn into_items(value: TagValue) -> Vec<String> {
    match value {
        TagValue::Text(text) => vec![text],
        TagValue::List(items) => items,
        TagValue::Number(number) => vec![number.to_string()],
        TagValue::Described { text, .. } => vec![text],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_keys_become_a_list() {
        let mut raw = RawTags::default();
        raw.insert("genre", TagValue::Text("Rock".to_string()));
        raw.insert("genre", TagValue::Text("Blues".to_string()));
        raw.insert("genre", TagValue::Number(17));
        assert_eq!(
            raw.get("genre"),
            Some(&TagValue::List(vec![
                "Rock".to_string(),
                "Blues".to_string(),
                "17".to_string()
            ]))
        );
    }

    #[test]
    fn with_text_builds_dictionary() {
        let raw = RawTags::default()
            .with_text("artist", "Beatles")
            .with_text("album", "Abbey Road");
        assert_eq!(raw.tags.len(), 2);
        assert!(!raw.is_empty());
    }
}
