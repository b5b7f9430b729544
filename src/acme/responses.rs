#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub url: String,
    pub relation: String,
}

/// Everything the embedding HTTP layer needs to render a reply: status, body,
/// `Location`, `Link` headers, the fresh `Replay-Nonce` and an optional
/// `Retry-After`.
#[derive(Debug)]
pub struct AcmeResponse<T> {
    pub status: u16,
    pub body: T,
    pub location: Option<String>,
    pub links: Vec<Link>,
    pub replay_nonce: String,
    pub retry_after: Option<u32>,
}

impl<T> AcmeResponse<T> {
    pub fn new(status: u16, body: T, replay_nonce: String) -> AcmeResponse<T> {
        AcmeResponse {
            status,
            body,
            location: None,
            links: vec![],
            replay_nonce,
            retry_after: None,
        }
    }

    pub fn with_location(mut self, location: String) -> AcmeResponse<T> {
        self.location = Some(location);
        self
    }

    pub fn with_link(mut self, url: String, relation: &str) -> AcmeResponse<T> {
        self.links.push(Link {
            url,
            relation: relation.to_string(),
        });
        self
    }

    pub fn with_retry_after(mut self, secs: u32) -> AcmeResponse<T> {
        self.retry_after = Some(secs);
        self
    }
}
