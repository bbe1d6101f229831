use tracing::warn;

use crate::{
    outbound::{Portal, RequestBody},
    query::FilterTree,
};

/// Result table columns: the fields named by the query's filters followed by
/// the server's guesses, without repeats. Each column is a group of fields.
pub async fn guess_headers(
    portal: &dyn Portal,
    filters: &FilterTree,
    request: &RequestBody,
    size: u32,
) -> Vec<Vec<String>> {
    let mut headers = filters.field_headers();
    let request = RequestBody {
        after: None,
        ..request.clone()
    }
    .with_size(size);
    match portal.guess_fields(&request).await {
        Ok(groups) => headers.extend(
            groups
                .into_iter()
                .map(|g| g.fields.keys().cloned().collect::<Vec<_>>()),
        ),
        Err(e) => warn!("could not guess result fields: {e}"),
    }

    let mut unique: Vec<Vec<String>> = Vec::with_capacity(headers.len());
    for header in headers {
        if !header.is_empty() && !unique.contains(&header) {
            unique.push(header);
        }
    }
    unique
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::{query::DisplayMeta, query::ROOT, testing::FakePortal};

    fn tree() -> FilterTree {
        let mut tree = FilterTree::new();
        tree.add_term(ROOT, "string_contains", json!({"fields": ["locality"], "value": "Kent"}), DisplayMeta::default())
            .unwrap();
        tree.add_term(ROOT, "string_equals", json!({"fields": ["genus"], "value": "Pieris"}), DisplayMeta::default())
            .unwrap();
        tree
    }

    #[tokio::test]
    async fn filter_fields_then_guesses_without_repeats() {
        let portal = FakePortal::default();
        portal.set_guessed(vec![
            json!({"fields": {"scientificName": {}}}),
            json!({"fields": {"locality": {}}}),
            json!({"fields": {"year": {}, "eventDate": {}}}),
        ]);
        let headers = guess_headers(&portal, &tree(), &RequestBody::default(), 15).await;
        assert_eq!(
            headers,
            vec![
                vec!["locality".to_string()],
                vec!["scientificName".to_string()],
                vec!["year".to_string(), "eventDate".to_string()],
            ]
        );
    }

    #[tokio::test]
    async fn failed_guess_keeps_filter_fields() {
        let portal = FakePortal::default();
        let headers = guess_headers(&portal, &tree(), &RequestBody::default(), 15).await;
        assert_eq!(headers, vec![vec!["locality".to_string()]]);
    }
}
