/// Idempotency-Keyヘッダーのヘルパー。
///
/// 同一バッチの再送をサーバー側で重複排除できるよう、ジョブIDとバッチ番号から
/// 決定的なキーを作る。
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use uuid::Uuid;

pub(crate) const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Bearerトークンと Idempotency-Key を含むヘッダーを構築する。
pub(crate) fn build_append_headers(token: &str, job_id: Uuid, batch: usize) -> HeaderMap {
    let mut headers = HeaderMap::new();

    if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
        headers.insert(AUTHORIZATION, value);
    }

    let key = format!("{job_id}:batch-{batch}");
    if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(IDEMPOTENCY_KEY_HEADER.as_bytes()),
        HeaderValue::from_str(&key),
    ) {
        headers.insert(name, value);
    }

    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_stable_per_job_and_batch() {
        let job_id = Uuid::nil();
        let a = build_append_headers("t", job_id, 2);
        let b = build_append_headers("t", job_id, 2);

        assert_eq!(a.get(IDEMPOTENCY_KEY_HEADER), b.get(IDEMPOTENCY_KEY_HEADER));
        assert_eq!(
            a.get(IDEMPOTENCY_KEY_HEADER).and_then(|v| v.to_str().ok()),
            Some("00000000-0000-0000-0000-000000000000:batch-2")
        );
        assert_eq!(
            a.get(AUTHORIZATION).and_then(|v| v.to_str().ok()),
            Some("Bearer t")
        );
    }

    #[test]
    fn invalid_token_characters_are_dropped() {
        let headers = build_append_headers("bad\ntoken", Uuid::nil(), 1);
        assert!(headers.get(AUTHORIZATION).is_none());
        assert!(headers.get(IDEMPOTENCY_KEY_HEADER).is_some());
    }
}
