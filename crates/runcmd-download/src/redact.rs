use url::Url;

/// Returns `uri` without its query string and fragment so SAS signatures never reach logs
/// or error messages.
pub fn uri_for_logging(uri: &str) -> String {
    match Url::parse(uri) {
        Ok(mut parsed) => {
            parsed.set_query(None);
            parsed.set_fragment(None);
            parsed.to_string()
        }
        Err(_) => match uri.split_once('?') {
            Some((base, _)) => base.to_string(),
            None => uri.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::uri_for_logging;

    #[test]
    fn unit_uri_for_logging_strips_sas_query() {
        assert_eq!(
            uri_for_logging("https://acct.blob.core.windows.net/c/run.sh?sv=2020&sig=secret"),
            "https://acct.blob.core.windows.net/c/run.sh"
        );
    }

    #[test]
    fn unit_uri_for_logging_keeps_unparseable_input_without_query() {
        assert_eq!(uri_for_logging("not a uri?sig=secret"), "not a uri");
        assert_eq!(uri_for_logging("plain"), "plain");
    }
}
