//! Images referenced by a record, and secondary filters over them.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{outbound::RecordData, resources::ResourceDescriptor};

const ASSOCIATED_MEDIA: &str = "associatedMedia";
/// Filter key that matches on the image's position within its record.
pub const IMAGE_INDEX_KEY: &str = "ix";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageRef {
    pub id: String,
    pub ix: usize,
    pub url: String,
    pub download: String,
    pub preview: String,
    pub thumbnail: String,
    pub title: String,
    pub licence: Option<String>,
    /// IIIF image information document, fetched to confirm the image loads.
    pub info_url: Option<String>,
    /// The record's own metadata about this image, when it has any.
    pub data: Option<Value>,
}

/// Display title of a record: its title field, falling back to `_id`.
pub fn record_title(record: &RecordData, descriptor: Option<&ResourceDescriptor>) -> String {
    let field = descriptor.map_or("_id", |d| d.title_field.as_str());
    record
        .data
        .get(field)
        .or_else(|| record.data.get("_id"))
        .map(value_text)
        .unwrap_or_default()
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Every image a record references, in record order. IIIF manifest items
/// win over `associatedMedia`, which wins over the resource's image field.
pub fn derive_images(record: &RecordData, descriptor: Option<&ResourceDescriptor>) -> Vec<ImageRef> {
    let title = record_title(record, descriptor);
    let iiif = iiif_images(record, descriptor, &title);
    if !iiif.is_empty() {
        return iiif;
    }
    if let Some(Value::Array(media)) = record.data.get(ASSOCIATED_MEDIA) {
        return media_images(media, descriptor, &title);
    }
    field_images(record, descriptor, &title)
}

fn iiif_images(
    record: &RecordData,
    descriptor: Option<&ResourceDescriptor>,
    title: &str,
) -> Vec<ImageRef> {
    let Some(items) = record
        .iiif
        .as_ref()
        .and_then(|m| m.get("items"))
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };
    let dwc = descriptor.is_some_and(|d| d.dwc);
    let record_id = record.key();
    items
        .iter()
        .enumerate()
        .filter_map(|(ix, item)| {
            let url = item
                .pointer("/items/0/items/0/body/id")
                .and_then(Value::as_str)?
                .to_string();
            let data = dwc
                .then(|| {
                    record
                        .data
                        .get(ASSOCIATED_MEDIA)
                        .and_then(Value::as_array)
                        .and_then(|media| {
                            media.iter().find(|m| {
                                m.get("identifier").and_then(Value::as_str) == Some(url.as_str())
                            })
                        })
                        .cloned()
                })
                .flatten();
            Some(ImageRef {
                id: format!("{}/{record_id}/{ix}", record.resource),
                ix,
                download: format!("{url}/full/max/0/default.jpg"),
                preview: format!("{url}/full/!1500,1500/0/default.jpg"),
                thumbnail: format!("{url}/full/200,/0/default.jpg"),
                title: title.to_string(),
                licence: descriptor.and_then(|d| d.image_licence.clone()),
                info_url: Some(format!("{url}/info.json")),
                url,
                data,
            })
        })
        .collect()
}

fn media_images(
    media: &[Value],
    descriptor: Option<&ResourceDescriptor>,
    title: &str,
) -> Vec<ImageRef> {
    media
        .iter()
        .enumerate()
        .filter_map(|(ix, img)| {
            let identifier = img.get("identifier").and_then(Value::as_str)?;
            Some(ImageRef {
                id: identifier.to_string(),
                ix,
                url: identifier.to_string(),
                download: format!("{identifier}/original"),
                preview: format!("{identifier}/preview"),
                thumbnail: format!("{identifier}/thumbnail"),
                title: img
                    .get("title")
                    .and_then(Value::as_str)
                    .unwrap_or(title)
                    .to_string(),
                licence: img
                    .get("license")
                    .and_then(Value::as_str)
                    .map(ToString::to_string)
                    .or_else(|| descriptor.and_then(|d| d.image_licence.clone())),
                info_url: None,
                data: Some(img.clone()),
            })
        })
        .collect()
}

fn field_images(
    record: &RecordData,
    descriptor: Option<&ResourceDescriptor>,
    title: &str,
) -> Vec<ImageRef> {
    let Some(descriptor) = descriptor else {
        return Vec::new();
    };
    let Some(Value::String(raw)) = descriptor
        .image_field
        .as_ref()
        .and_then(|f| record.data.get(f))
    else {
        return Vec::new();
    };
    let urls: Vec<&str> = if descriptor.image_delimiter.is_empty() {
        vec![raw.as_str()]
    } else {
        raw.split(descriptor.image_delimiter.as_str()).collect()
    };
    let id = record.data.get("_id").map(value_text).unwrap_or_default();
    urls.into_iter()
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .enumerate()
        .map(|(ix, url)| ImageRef {
            id: format!("{id}_{ix}"),
            ix,
            url: url.to_string(),
            download: url.to_string(),
            preview: url.to_string(),
            thumbnail: url.to_string(),
            title: title.to_string(),
            licence: descriptor.image_licence.clone(),
            info_url: None,
            data: None,
        })
        .collect()
}

/// Allowed values per image metadata path. Every entry must match for an
/// image to be kept; `ix` matches the image's index within its record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageFilter(pub IndexMap<String, Vec<String>>);

impl ImageFilter {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn allow(mut self, path: impl Into<String>, values: Vec<String>) -> Self {
        self.0.insert(path.into(), values);
        self
    }

    pub fn matches(&self, image: &ImageRef) -> bool {
        self.0.iter().all(|(path, allowed)| {
            if path == IMAGE_INDEX_KEY {
                return allowed.contains(&image.ix.to_string());
            }
            let mut value = image.data.as_ref();
            for key in path.split('.') {
                value = value.and_then(|v| v.get(key));
            }
            value.is_some_and(|v| allowed.contains(&value_text(v)))
        })
    }
}
