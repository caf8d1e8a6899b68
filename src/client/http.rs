use log::debug;
use reqwest::Method;
use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;

use crate::client::{HttpOps, HttpReply, HttpVerb};
use crate::config::ConnectionOptions;
use crate::Result;

/// Blocking HTTP client for a Cloudant/CouchDB endpoint.
pub struct CloudantHttpClient {
    client: Client,
    username: Option<String>,
    password: Option<String>,
}

impl CloudantHttpClient {
    #[allow(missing_docs)]
    pub fn new(options: &ConnectionOptions) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = options.connect_timeout() {
            builder = builder.connect_timeout(timeout);
        }
        if let Some(timeout) = options.io_timeout() {
            builder = builder.timeout(timeout);
        }
        if options.tls {
            builder = builder.https_only(true);
        }
        Ok(CloudantHttpClient {
            client: builder.build()?,
            username: options.username.clone(),
            password: options.password.clone(),
        })
    }
}

fn method_of(verb: HttpVerb) -> Method {
    match verb {
        HttpVerb::Get => Method::GET,
        HttpVerb::Put => Method::PUT,
        HttpVerb::Post => Method::POST,
        HttpVerb::Delete => Method::DELETE,
        HttpVerb::Head => Method::HEAD,
    }
}

impl HttpOps for CloudantHttpClient {
    fn send(&mut self, verb: HttpVerb, url: &str, body: Option<&str>) -> Result<HttpReply> {
        let mut request = self.client.request(method_of(verb), url);
        if let Some(user) = &self.username {
            request = request.basic_auth(user, self.password.as_deref());
        }
        if let Some(json) = body {
            request = request
                .header(CONTENT_TYPE, "application/json")
                .body(json.to_string());
        }
        let response = request.send()?;
        let status = response.status().as_u16();
        let body = response.text()?;
        debug!("{} {} -> {}", verb, url, status);
        Ok(HttpReply { status, body })
    }
}
