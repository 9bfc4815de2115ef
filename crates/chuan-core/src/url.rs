//! URL 解析与缓存键推导.
//!
//! 同一资源可能分布在多个 CDN 域名上, 缓存键只取路径部分:
//! 去掉协议与域名、去掉查询串、在常见容器后缀处截断,
//! 因此换域名/换签名参数后仍命中同一份缓存.

/// 缓存键截断用的容器后缀
const CONTAINER_SUFFIXES: [&str; 3] = [".mp4", ".mov", ".mkv"];

/// URL 解析结果
///
/// 相等性按 uri (路径) 比较, 域名与端口不参与.
#[derive(Debug, Clone, Default)]
pub struct UrlParser {
    protocol: String,
    domain: String,
    port: u16,
    uri: String,
}

impl UrlParser {
    /// 解析 URL, 无法解析的部分置空
    pub fn parse(url: &str) -> Self {
        let mut parser = UrlParser::default();

        let rest = match url.find("://") {
            Some(pos) => {
                parser.protocol = url[..pos].to_string();
                &url[pos + 3..]
            }
            None => url,
        };

        let (authority, uri) = match rest.find('/') {
            Some(pos) => (&rest[..pos], &rest[pos..]),
            None => (rest, ""),
        };

        match authority.rfind(':') {
            Some(pos) => {
                parser.domain = authority[..pos].to_string();
                parser.port = authority[pos + 1..].parse().unwrap_or(0);
            }
            None => {
                parser.domain = authority.to_string();
                parser.port = match parser.protocol.as_str() {
                    "https" => 443,
                    "http" => 80,
                    _ => 0,
                };
            }
        }

        parser.uri = uri.to_string();
        parser
    }

    /// 协议名 (http / https / ...)
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// 域名
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// 端口, 未知协议且未显式给出时为 0
    pub fn port(&self) -> u16 {
        self.port
    }

    /// 路径部分 (以 '/' 开头, 含查询串)
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// 推导缓存键: 去查询串, 在容器后缀处截断, '/' 替换为 '_'
    pub fn cache_key(&self) -> String {
        let mut key = match self.uri.find('?') {
            Some(pos) => &self.uri[..pos],
            None => &self.uri[..],
        };
        for suffix in CONTAINER_SUFFIXES {
            if let Some(pos) = key.find(suffix) {
                key = &key[..pos + suffix.len()];
                break;
            }
        }
        key.replace('/', "_")
    }
}

impl PartialEq for UrlParser {
    fn eq(&self, other: &Self) -> bool {
        self.uri == other.uri
    }
}

impl Eq for UrlParser {}

/// 直接从 URL 推导缓存键
pub fn cache_key_of(url: &str) -> String {
    UrlParser::parse(url).cache_key()
}

/// 按分隔符拆分 URL 列表, 分隔符为空时整串视作单个 URL
pub fn split_url_list(url: &str, separator: &str) -> Vec<String> {
    if separator.is_empty() {
        return vec![url.to_string()];
    }
    url.split(separator)
        .filter(|part| !part.is_empty())
        .map(|part| part.to_string())
        .collect()
}

/// 两个 URL 是否指向同一资源 (按缓存键比较)
pub fn same_resource(a: &str, b: &str) -> bool {
    cache_key_of(a) == cache_key_of(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_basic() {
        let p = UrlParser::parse("https://cdn.example.com/v/abc.mp4?sign=123");
        assert_eq!(p.protocol(), "https");
        assert_eq!(p.domain(), "cdn.example.com");
        assert_eq!(p.port(), 443);
        assert_eq!(p.uri(), "/v/abc.mp4?sign=123");
    }

    #[test]
    fn parse_explicit_port() {
        let p = UrlParser::parse("http://cdn.example.com:8080/v/abc.mp4");
        assert_eq!(p.port(), 8080);
        assert_eq!(p.domain(), "cdn.example.com");
    }

    #[test]
    fn cache_key_strips_query_and_host() {
        let a = cache_key_of("https://cdn1.example.com/v/abc.mp4?sign=123");
        let b = cache_key_of("http://cdn2.example.net/v/abc.mp4?sign=456&t=9");
        assert_eq!(a, "_v_abc.mp4");
        assert_eq!(a, b);
    }

    #[test]
    fn cache_key_cuts_at_suffix() {
        let key = cache_key_of("https://h/v/abc.mp4/extra/trailer");
        assert_eq!(key, "_v_abc.mp4");
    }

    #[test]
    fn equality_by_uri() {
        let a = UrlParser::parse("https://h1/v/abc.mkv");
        let b = UrlParser::parse("http://h2:8080/v/abc.mkv");
        assert_eq!(a, b);
    }

    #[test]
    fn url_list_split() {
        let list = split_url_list("http://a/v.mp4;http://b/v.mp4", ";");
        assert_eq!(list.len(), 2);
        assert_eq!(list[1], "http://b/v.mp4");

        let single = split_url_list("http://a/v.mp4", "");
        assert_eq!(single, vec!["http://a/v.mp4".to_string()]);
    }
}
