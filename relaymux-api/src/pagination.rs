//! Slice pagination for list endpoints.
//!
//! `itemsPerPage` defaults to 100, `page` is 0-based. The response envelope
//! is `{itemCount, pageCount, items}`; pages past the end yield empty items
//! with correct counts.

use serde::Serialize;

use crate::error::ApiError;

pub const DEFAULT_ITEMS_PER_PAGE: usize = 100;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageEnvelope<T> {
    pub item_count: usize,
    pub page_count: usize,
    pub items: Vec<T>,
}

/// Parsed and validated pagination query parameters.
#[derive(Debug, Clone, Copy)]
pub struct PageParams {
    pub items_per_page: usize,
    pub page: usize,
}

impl PageParams {
    /// Parse `itemsPerPage` and `page` from raw query values. Zero, negative
    /// and non-integer values are errors.
    pub fn from_query(
        items_per_page: Option<&str>,
        page: Option<&str>,
    ) -> Result<Self, ApiError> {
        let items_per_page = match items_per_page {
            None => DEFAULT_ITEMS_PER_PAGE,
            Some(raw) => {
                let parsed: i64 = raw.parse().map_err(|_| {
                    ApiError::bad_request(format!("invalid itemsPerPage '{raw}'"))
                })?;
                if parsed <= 0 {
                    return Err(ApiError::bad_request(format!(
                        "invalid itemsPerPage '{raw}'"
                    )));
                }
                parsed as usize
            }
        };
        let page = match page {
            None => 0,
            Some(raw) => {
                let parsed: i64 = raw
                    .parse()
                    .map_err(|_| ApiError::bad_request(format!("invalid page '{raw}'")))?;
                if parsed < 0 {
                    return Err(ApiError::bad_request(format!("invalid page '{raw}'")));
                }
                parsed as usize
            }
        };
        Ok(Self {
            items_per_page,
            page,
        })
    }
}

/// Slice `items` down to the requested page and wrap it in the envelope.
pub fn paginate<T>(items: Vec<T>, params: PageParams) -> PageEnvelope<T> {
    let item_count = items.len();
    let page_count = item_count.div_ceil(params.items_per_page);

    let from = (params.page.saturating_mul(params.items_per_page)).min(item_count);
    let to = ((params.page + 1).saturating_mul(params.items_per_page)).min(item_count);

    let items = items
        .into_iter()
        .skip(from)
        .take(to - from)
        .collect();

    PageEnvelope {
        item_count,
        page_count,
        items,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(items_per_page: usize, page: usize) -> PageParams {
        PageParams {
            items_per_page,
            page,
        }
    }

    #[test]
    fn test_empty() {
        let env = paginate(Vec::<i32>::new(), params(100, 0));
        assert_eq!(env.item_count, 0);
        assert_eq!(env.page_count, 0);
        assert!(env.items.is_empty());
    }

    #[test]
    fn test_exact_pages() {
        let env = paginate((0..10).collect(), params(5, 0));
        assert_eq!(env.item_count, 10);
        assert_eq!(env.page_count, 2);
        assert_eq!(env.items, vec![0, 1, 2, 3, 4]);

        let env = paginate((0..10).collect(), params(5, 1));
        assert_eq!(env.items, vec![5, 6, 7, 8, 9]);
    }

    #[test]
    fn test_partial_last_page() {
        let env = paginate((0..7).collect(), params(3, 2));
        assert_eq!(env.page_count, 3);
        assert_eq!(env.items, vec![6]);
    }

    #[test]
    fn test_page_past_end() {
        let env = paginate((0..7).collect(), params(3, 9));
        assert_eq!(env.item_count, 7);
        assert_eq!(env.page_count, 3);
        assert!(env.items.is_empty());
    }

    #[test]
    fn test_query_parsing() {
        let p = PageParams::from_query(None, None).unwrap();
        assert_eq!(p.items_per_page, 100);
        assert_eq!(p.page, 0);

        let p = PageParams::from_query(Some("25"), Some("3")).unwrap();
        assert_eq!(p.items_per_page, 25);
        assert_eq!(p.page, 3);

        assert!(PageParams::from_query(Some("0"), None).is_err());
        assert!(PageParams::from_query(Some("-5"), None).is_err());
        assert!(PageParams::from_query(Some("1.5"), None).is_err());
        assert!(PageParams::from_query(Some("abc"), None).is_err());
        assert!(PageParams::from_query(None, Some("-1")).is_err());
    }
}
