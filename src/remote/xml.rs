//! XML payloads exchanged with the subscription service.

use crate::models::QuestionResponse;
use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use std::collections::BTreeSet;

/// Body for creating a subscriber attached to `topic`, with notifications off.
pub fn compose_subscriber(email: &str, topic: &str) -> String {
    format!(
        "<subscriber>\
         <email>{}</email>\
         <send-notifications type=\"boolean\">false</send-notifications>\
         <topics type=\"array\"><topic><code>{}</code></topic></topics>\
         </subscriber>",
        escape(email),
        escape(topic)
    )
}

/// Body replacing a subscriber's full topic set.
pub fn compose_topics<'a>(topics: impl IntoIterator<Item = &'a String>) -> String {
    let mut body = String::from("<subscriber><send-notifications type=\"boolean\">false</send-notifications><topics type=\"array\">");
    for topic in topics {
        body.push_str("<topic><code>");
        body.push_str(&escape(topic.as_str()));
        body.push_str("</code></topic>");
    }
    body.push_str("</topics></subscriber>");
    body
}

pub fn compose_responses(responses: &[QuestionResponse]) -> String {
    let mut body = String::from("<responses type=\"array\">");
    for response in responses {
        body.push_str("<response><question-id>");
        body.push_str(&escape(response.question_id.as_str()));
        body.push_str("</question-id><answer-id>");
        body.push_str(&escape(response.answer_id.as_str()));
        body.push_str("</answer-id></response>");
    }
    body.push_str("</responses>");
    body
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum TopicField {
    ToParam,
    Code,
}

/// Topic codes from a `<topics>` document.
///
/// Each `<topic>` contributes its `to-param`, or its `code` when `to-param`
/// is absent. An empty document yields an empty set.
pub fn parse_topics(xml: &str) -> Result<BTreeSet<String>, String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut topics = BTreeSet::new();
    let mut in_topic = false;
    let mut capture: Option<TopicField> = None;
    let mut to_param: Option<String> = None;
    let mut code: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"topic" => {
                    in_topic = true;
                    to_param = None;
                    code = None;
                }
                b"to-param" if in_topic => capture = Some(TopicField::ToParam),
                b"code" if in_topic => capture = Some(TopicField::Code),
                _ => capture = None,
            },
            Ok(Event::Text(ref e)) => {
                if let Some(field) = capture {
                    let text = e.unescape().map_err(|e| e.to_string())?.into_owned();
                    match field {
                        TopicField::ToParam => to_param = Some(text),
                        TopicField::Code => code = Some(text),
                    }
                }
            }
            Ok(Event::End(ref e)) => {
                if e.name().as_ref() == b"topic" {
                    if let Some(value) = to_param.take().or(code.take()) {
                        topics.insert(value);
                    }
                    in_topic = false;
                }
                capture = None;
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(format!("error at position {}: {}", reader.buffer_position(), e)),
            _ => {}
        }
    }

    Ok(topics)
}

/// First `<code>` of an `<errors>` document, if the body is one.
pub fn parse_error_code(xml: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut in_code = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => in_code = e.name().as_ref() == b"code",
            Ok(Event::Text(ref e)) if in_code => {
                return e.unescape().ok().map(|text| text.trim().to_string());
            }
            Ok(Event::End(_)) => in_code = false,
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_topics_prefers_to_param() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
            <topics type="array">
              <topic>
                <code>USNCI_1</code>
                <name>All Staff</name>
                <to-param>USNCI_1</to-param>
              </topic>
              <topic>
                <code>ignored</code>
                <to-param>NEWS</to-param>
              </topic>
            </topics>"#;

        let topics = parse_topics(xml).unwrap();
        assert_eq!(
            topics.into_iter().collect::<Vec<_>>(),
            vec!["NEWS".to_string(), "USNCI_1".to_string()]
        );
    }

    #[test]
    fn test_parse_topics_single_and_empty() {
        let single = "<topics><topic><code>ONLY</code></topic></topics>";
        assert_eq!(parse_topics(single).unwrap().len(), 1);

        let empty = r#"<topics type="array"/>"#;
        assert!(parse_topics(empty).unwrap().is_empty());
    }

    #[test]
    fn test_parse_error_code() {
        let body = "<errors><code>GD-15002</code><error>Subscriber not found</error></errors>";
        assert_eq!(parse_error_code(body).as_deref(), Some("GD-15002"));
        assert_eq!(parse_error_code("not xml at all"), None);
    }

    #[test]
    fn test_compose_escapes_values() {
        let body = compose_subscriber("o'neil&co@x.gov", "ALLSTAFF");
        assert!(body.contains("<email>o&apos;neil&amp;co@x.gov</email>"));
        assert!(body.contains("<code>ALLSTAFF</code>"));
    }

    #[test]
    fn test_compose_responses_empty_clears() {
        assert_eq!(compose_responses(&[]), "<responses type=\"array\"></responses>");

        let body = compose_responses(&[QuestionResponse {
            question_id: "q1".into(),
            answer_id: "a1".into(),
        }]);
        assert!(body.contains("<question-id>q1</question-id><answer-id>a1</answer-id>"));
    }

    #[test]
    fn test_compose_topics_lists_every_code() {
        let topics: BTreeSet<String> = ["NEWS".to_string(), "ALLSTAFF".to_string()].into();
        let body = compose_topics(&topics);
        assert!(body.contains("<topic><code>ALLSTAFF</code></topic><topic><code>NEWS</code></topic>"));
    }
}
