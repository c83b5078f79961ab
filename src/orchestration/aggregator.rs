use crate::core::types::BannerRecord;

/// Concatenate per-URL results in submission order.
///
/// No deduplication across URLs. Returns `None` when nothing was found so
/// the response carries `"banner_list": null` rather than an empty array.
pub fn aggregate(per_url: Vec<(String, Vec<BannerRecord>)>) -> Option<Vec<BannerRecord>> {
    let total: usize = per_url.iter().map(|(_, records)| records.len()).sum();
    if total == 0 {
        return None;
    }

    let mut flat = Vec::with_capacity(total);
    for (_, records) in per_url {
        flat.extend(records);
    }
    Some(flat)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{BoundingBox, Region};

    fn banner(text: &str) -> BannerRecord {
        BannerRecord {
            region: Region {
                bounding_box: BoundingBox::new(0, 0, 10, 10),
                confidence: 0.9,
            },
            text: text.to_string(),
            label: "ad".to_string(),
            label_confidence: 1.0,
        }
    }

    #[test]
    fn test_empty_is_none() {
        assert_eq!(aggregate(vec![]), None);
        assert_eq!(
            aggregate(vec![("a".into(), vec![]), ("b".into(), vec![])]),
            None
        );
    }

    #[test]
    fn test_preserves_submission_order() {
        let result = aggregate(vec![
            ("u1".into(), vec![banner("b1")]),
            ("u2".into(), vec![]),
            ("u3".into(), vec![banner("b2"), banner("b3")]),
        ])
        .unwrap();

        let texts: Vec<&str> = result.iter().map(|b| b.text.as_str()).collect();
        assert_eq!(texts, vec!["b1", "b2", "b3"]);
    }

    #[test]
    fn test_keeps_duplicates() {
        let result = aggregate(vec![
            ("same".into(), vec![banner("x")]),
            ("same".into(), vec![banner("x")]),
        ])
        .unwrap();
        assert_eq!(result.len(), 2);
    }
}
