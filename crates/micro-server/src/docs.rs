//! Redoc API documentation page.

use axum::http::{Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use routing::{PathParams, Route};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tonic::Status;

pub const DEFAULT_DOCS_ROUTE: &str = "/docs";
pub const DEFAULT_REDOC_URL: &str =
    "https://cdn.jsdelivr.net/npm/redoc@next/bundles/redoc.standalone.js";
pub const DEFAULT_TITLE: &str = "API documentation";

/// Options of the documentation route.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocsOptions {
    /// Whether the route is served at all.
    pub enabled: bool,
    /// Route path; empty or `/` falls back to `/docs`.
    pub route: String,
    /// OpenAPI documents listed on the page, name -> url.
    pub spec_urls: BTreeMap<String, String>,
    /// Script rendering the page.
    pub redoc_url: String,
    /// Page title.
    pub title: String,
}

impl DocsOptions {
    /// Enabled options with every default filled in.
    pub fn enabled() -> Self {
        let mut options = Self {
            enabled: true,
            ..Self::default()
        };
        options.ensure_defaults();
        options
    }

    /// Fill in unset fields.
    ///
    /// The root route cannot host the page since the static fallback owns it.
    pub fn ensure_defaults(&mut self) {
        if self.route.is_empty() || self.route == "/" {
            self.route = DEFAULT_DOCS_ROUTE.to_string();
        }
        if self.spec_urls.is_empty() {
            self.add_spec("Service", "/swagger.json");
        }
        if self.redoc_url.is_empty() {
            self.redoc_url = DEFAULT_REDOC_URL.to_string();
        }
        if self.title.is_empty() {
            self.title = DEFAULT_TITLE.to_string();
        }
    }

    /// List an OpenAPI document on the page.
    pub fn add_spec(&mut self, name: impl Into<String>, url: impl Into<String>) -> &mut Self {
        self.spec_urls.insert(name.into(), url.into());
        self
    }

    /// Render the HTML page.
    pub fn render(&self) -> String {
        let apis: Vec<serde_json::Value> = self
            .spec_urls
            .iter()
            .map(|(name, url)| serde_json::json!({ "name": name, "url": url }))
            .collect();
        let apis = serde_json::Value::Array(apis)
            .to_string()
            .replace("</", "<\\/");

        REDOC_TEMPLATE
            .replace("{{title}}", &escape_html(&self.title))
            .replace("{{redoc_url}}", &escape_html(&self.redoc_url))
            .replace("{{apis}}", &apis)
    }
}

/// `GET` route serving the documentation page.
pub(crate) fn docs_route(mut options: DocsOptions) -> Route {
    options.ensure_defaults();
    let page = options.render();
    Route::new(Method::GET, &options.route, move |_req, _params: PathParams| {
        let response = html(page.clone());
        async move { Ok::<_, Status>(response) }
    })
}

fn html(page: String) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        page,
    )
        .into_response()
}

fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&#34;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

const REDOC_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
  <head>
    <title>{{title}}</title>
    <meta name="viewport" content="width=device-width, initial-scale=1">
    <style>
      body {
        margin: 0;
        padding-top: 40px;
      }
      nav {
        position: fixed;
        top: 0;
        width: 100%;
        z-index: 100;
      }
      #links_container {
        margin: 0;
        padding: 0;
        background-color: #0033a0;
      }
      #links_container li {
        display: inline-block;
        padding: 10px;
        color: white;
        cursor: pointer;
      }
    </style>
  </head>
  <body>
    <nav>
      <ul id="links_container"></ul>
    </nav>
    <redoc scroll-y-offset="body > nav"></redoc>
    <script src="{{redoc_url}}"></script>
    <script>
      var apis = {{apis}};
      Redoc.init(apis[0].url);
      function onClick() {
        Redoc.init(this.getAttribute('data-link'));
      }
      var list = document.getElementById('links_container');
      apis.forEach(function(api) {
        var item = document.createElement('li');
        item.setAttribute('data-link', api.url);
        item.innerText = api.name;
        item.addEventListener('click', onClick);
        list.appendChild(item);
      });
    </script>
  </body>
</html>
"#;
