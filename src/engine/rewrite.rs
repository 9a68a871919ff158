use url::Url;

use crate::rules::Endpoint;

/// Points `original` at `target` over plain HTTP.
///
/// Scheme, host and port come from the endpoint; path, query and fragment
/// are carried over unchanged.
pub fn rewrite(original: &Url, target: &Endpoint) -> Url {
    let mut url = target.base_url().clone();
    url.set_path(original.path());
    url.set_query(original.query());
    url.set_fragment(original.fragment());
    url
}
