//! # Query module
//!
//! This module provide the tag-scoped search api, results are paginated by
//! the fabric and pulled transparently until exhaustion

use serde::{de::DeserializeOwned, Deserialize};

use crate::svc::nsx::{client::Client, Error};

// -----------------------------------------------------------------------------
// Constants

pub const SEARCH: &str = "/policy/api/v1/search/query";

// -----------------------------------------------------------------------------
// TagQuery structure

#[derive(PartialEq, Eq, Clone, Debug)]
pub struct TagQuery {
    resource_type: String,
    scopes: Vec<(String, String)>,
}

impl TagQuery {
    pub fn new(resource_type: &str) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            scopes: vec![],
        }
    }

    pub fn tagged(mut self, scope: &str, tag: &str) -> Self {
        self.scopes.push((scope.to_string(), tag.to_string()));
        self
    }

    /// returns the search term, soft-deleted objects are always excluded
    pub fn term(&self) -> String {
        let mut term = format!("resource_type:{}", self.resource_type);

        for (scope, tag) in &self.scopes {
            term.push_str(&format!(
                " AND tags.scope:{} AND tags.tag:{}",
                escape(scope),
                escape(tag)
            ));
        }

        term.push_str(" AND marked_for_delete:false");
        term
    }
}

/// escape the characters the search grammar reserves
fn escape(s: &str) -> String {
    s.replace('/', "\\/").replace(':', "\\:")
}

/// percent-encode the characters that cannot appear raw in a query string
fn encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            ' ' => out.push_str("%20"),
            '"' => out.push_str("%22"),
            '#' => out.push_str("%23"),
            '%' => out.push_str("%25"),
            '&' => out.push_str("%26"),
            '+' => out.push_str("%2B"),
            '?' => out.push_str("%3F"),
            '\\' => out.push_str("%5C"),
            _ => out.push(c),
        }
    }

    out
}

// -----------------------------------------------------------------------------
// SearchResponse structure

#[derive(Deserialize, Debug)]
pub struct SearchResponse<T> {
    #[serde(rename = "results", default = "Vec::new")]
    pub results: Vec<T>,
    #[serde(rename = "cursor", default)]
    pub cursor: Option<String>,
    #[serde(rename = "result_count", default)]
    pub result_count: Option<u64>,
}

// -----------------------------------------------------------------------------
// Pager structure

/// an unpaginated view over a paginated search, each call to
/// [`Pager::try_next`] pulls one page
pub struct Pager<T> {
    client: Client,
    term: String,
    cursor: Option<String>,
    fetched: u64,
    done: bool,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T> Pager<T>
where
    T: DeserializeOwned,
{
    pub fn new(client: &Client, query: &TagQuery) -> Self {
        Self {
            client: client.to_owned(),
            term: query.term(),
            cursor: None,
            fetched: 0,
            done: false,
            _marker: std::marker::PhantomData,
        }
    }

    pub async fn try_next(&mut self) -> Result<Option<Vec<T>>, Error> {
        if self.done {
            return Ok(None);
        }

        let mut path = format!("{}?query={}", SEARCH, encode(&self.term));
        if let Some(cursor) = &self.cursor {
            path.push_str(&format!("&cursor={}", encode(cursor)));
        }

        let page: SearchResponse<T> = self.client.get(&path).await?;

        self.fetched += page.results.len() as u64;
        self.cursor = page.cursor;
        self.done = page.results.is_empty()
            || self.cursor.is_none()
            || page.result_count.is_some_and(|count| self.fetched >= count);

        if page.results.is_empty() {
            return Ok(None);
        }

        Ok(Some(page.results))
    }

    /// drain every remaining page
    pub async fn all(mut self) -> Result<Vec<T>, Error> {
        let mut results = vec![];

        while let Some(mut page) = self.try_next().await? {
            results.append(&mut page);
        }

        Ok(results)
    }
}

impl Client {
    /// returns every fabric object matching the given tag query
    pub async fn query_by_tags<T>(&self, query: &TagQuery) -> Result<Vec<T>, Error>
    where
        T: DeserializeOwned,
    {
        Pager::new(self, query).all().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::svc::nsx::{
        client::tests::Script,
        model::VpcSubnet,
        tag::{SCOPE_CLUSTER, SCOPE_NAMESPACE},
    };

    fn client(script: Arc<Script>) -> Client {
        Client::new(script, vec!["mgr-1".to_string()], "admin", "password", "cluster-1")
            .expect("client to build")
    }

    #[test]
    fn term_should_exclude_soft_deleted_objects() {
        let term = TagQuery::new(VpcSubnet::RESOURCE_TYPE)
            .tagged(SCOPE_CLUSTER, "cluster-1")
            .tagged(SCOPE_NAMESPACE, "ns-a")
            .term();

        assert_eq!(
            term,
            "resource_type:VpcSubnet AND tags.scope:nsx-op\\/cluster AND tags.tag:cluster-1 \
             AND tags.scope:nsx-op\\/namespace AND tags.tag:ns-a AND marked_for_delete:false"
        );
    }

    #[tokio::test]
    async fn pager_should_pull_until_exhaustion() {
        let script = Script::new(vec![
            (
                200,
                r#"{"results":[{"id":"s1","display_name":"s1"},{"id":"s2","display_name":"s2"}],"cursor":"2","result_count":3}"#,
            ),
            (
                200,
                r#"{"results":[{"id":"s3","display_name":"s3"}],"cursor":"3","result_count":3}"#,
            ),
        ]);

        let subnets: Vec<VpcSubnet> = client(script.to_owned())
            .query_by_tags(&TagQuery::new(VpcSubnet::RESOURCE_TYPE).tagged(SCOPE_CLUSTER, "cluster-1"))
            .await
            .expect("query to succeed");

        assert_eq!(subnets.len(), 3);
        assert_eq!(script.seen.lock().expect("seen mutex to be healthy").len(), 2);
    }

    #[tokio::test]
    async fn pager_should_stop_on_empty_page() {
        let script = Script::new(vec![(200, r#"{"results":[]}"#)]);

        let subnets: Vec<VpcSubnet> = client(script)
            .query_by_tags(&TagQuery::new(VpcSubnet::RESOURCE_TYPE))
            .await
            .expect("query to succeed");

        assert!(subnets.is_empty());
    }
}
