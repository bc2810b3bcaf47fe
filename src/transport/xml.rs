// OBS 接口 XML 报文
//
// 响应体统一解析为扁平的 (元素路径, 文本) 列表，路径不含根元素，
// 如 ListPartsResult 中的 `Part/ETag`

use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;

#[derive(Debug, Default)]
pub(crate) struct XmlDocument {
    /// 根元素名
    root: Option<String>,
    /// (根下第几个子元素, 元素路径, 文本)
    fields: Vec<(usize, String, String)>,
}

impl XmlDocument {
    pub(crate) fn parse(body: &[u8]) -> Result<Self, quick_xml::Error> {
        let mut reader = Reader::from_reader(body);
        reader.trim_text(true);

        let mut doc = XmlDocument::default();
        let mut stack: Vec<String> = Vec::new();
        let mut child_seq = 0usize;
        let mut buf = Vec::new();

        loop {
            match reader.read_event_into(&mut buf)? {
                Event::Start(ref e) => {
                    let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                    if stack.is_empty() {
                        doc.root = Some(name.clone());
                    } else if stack.len() == 1 {
                        child_seq += 1;
                    }
                    stack.push(name);
                }
                Event::Text(ref e) => {
                    if stack.len() >= 2 {
                        let text = e.unescape()?.to_string();
                        doc.fields.push((child_seq, stack[1..].join("/"), text));
                    }
                }
                Event::CData(e) => {
                    if stack.len() >= 2 {
                        let text = String::from_utf8_lossy(&e.into_inner()).to_string();
                        doc.fields.push((child_seq, stack[1..].join("/"), text));
                    }
                }
                Event::End(_) => {
                    stack.pop();
                }
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        Ok(doc)
    }

    pub(crate) fn root(&self) -> Option<&str> {
        self.root.as_deref()
    }

    /// 第一个匹配路径的文本
    pub(crate) fn text(&self, path: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(_, p, _)| p == path)
            .map(|(_, _, text)| text.as_str())
    }

    /// 按重复出现的子元素分组，如所有 `Part`
    ///
    /// 返回每组内 (相对路径, 文本)
    pub(crate) fn groups(&self, element: &str) -> Vec<Vec<(&str, &str)>> {
        let prefix = format!("{}/", element);
        let mut groups: Vec<(usize, Vec<(&str, &str)>)> = Vec::new();

        for (seq, path, text) in &self.fields {
            let Some(relative) = path.strip_prefix(&prefix) else {
                continue;
            };
            match groups.last_mut() {
                Some((last_seq, fields)) if *last_seq == *seq => {
                    fields.push((relative, text.as_str()));
                }
                _ => groups.push((*seq, vec![(relative, text.as_str())])),
            }
        }

        groups.into_iter().map(|(_, fields)| fields).collect()
    }
}

/// 构造合并分段请求体
pub(crate) fn complete_multipart_body(parts: &[(u32, String)]) -> String {
    let mut xml = String::from("<CompleteMultipartUpload>");
    for (part_number, etag) in parts {
        xml.push_str(&format!(
            "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
            part_number,
            escape(etag.as_str())
        ));
    }
    xml.push_str("</CompleteMultipartUpload>");
    xml
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST_PARTS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListPartsResult xmlns="http://obs.myhwclouds.com/doc/2015-06-30/">
  <Bucket>bucket</Bucket>
  <Key>object</Key>
  <UploadId>00000163D40171ED8DF4050919BD02B8</UploadId>
  <NextPartNumberMarker>2</NextPartNumberMarker>
  <IsTruncated>true</IsTruncated>
  <Part>
    <PartNumber>1</PartNumber>
    <LastModified>2018-06-06T07:39:34.877Z</LastModified>
    <ETag>&quot;b026324c6904b2a9cb4b88d6d61c81d1&quot;</ETag>
    <Size>5242880</Size>
  </Part>
  <Part>
    <PartNumber>2</PartNumber>
    <LastModified>2018-06-06T07:39:35.011Z</LastModified>
    <ETag>"26ab0db90d72e28ad0ba1e22ee510510"</ETag>
    <Size>2097152</Size>
  </Part>
</ListPartsResult>"#;

    #[test]
    fn test_parse_list_parts() {
        let doc = XmlDocument::parse(LIST_PARTS.as_bytes()).unwrap();
        assert_eq!(doc.root(), Some("ListPartsResult"));
        assert_eq!(doc.text("IsTruncated"), Some("true"));
        assert_eq!(doc.text("NextPartNumberMarker"), Some("2"));

        let parts = doc.groups("Part");
        assert_eq!(parts.len(), 2);
        assert!(parts[0].contains(&("PartNumber", "1")));
        assert!(parts[0].contains(&("ETag", "\"b026324c6904b2a9cb4b88d6d61c81d1\"")));
        assert!(parts[1].contains(&("Size", "2097152")));
    }

    #[test]
    fn test_parse_error_body() {
        let body = "<Error><Code>NoSuchUpload</Code><Message>The specified upload does not exist.</Message><RequestId>0000018A</RequestId></Error>";
        let doc = XmlDocument::parse(body.as_bytes()).unwrap();
        assert_eq!(doc.root(), Some("Error"));
        assert_eq!(doc.text("Code"), Some("NoSuchUpload"));
        assert_eq!(doc.text("RequestId"), Some("0000018A"));
        assert!(doc.groups("Part").is_empty());
    }

    #[test]
    fn test_complete_body_keeps_order() {
        let body = complete_multipart_body(&[
            (1, "\"a\"".to_string()),
            (2, "\"b\"".to_string()),
        ]);
        let first = body.find("<PartNumber>1</PartNumber>").unwrap();
        let second = body.find("<PartNumber>2</PartNumber>").unwrap();
        assert!(first < second);
        assert!(body.starts_with("<CompleteMultipartUpload>"));
        assert!(body.contains("&quot;a&quot;"));
    }
}
