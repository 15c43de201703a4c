use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use regex::Regex;
use std::sync::LazyLock;

static VARIABLE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\{\{([a-z][a-z0-9_]*)\}\}").expect("valid template variable pattern")
});

static RE_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^re:").expect("valid reply prefix pattern"));

#[derive(Debug, Clone, Default)]
pub struct ComposeEmailParams<'a> {
    pub from: &'a str,
    pub from_name: Option<&'a str>,
    pub to: &'a str,
    pub subject: &'a str,
    /// HTML body, already rendered.
    pub body: &'a str,
    /// RFC 2822 date string.
    pub date: &'a str,
    pub in_reply_to: Option<&'a str>,
    pub references: Option<&'a str>,
    pub signature: Option<&'a str>,
    pub unsubscribe_link: Option<&'a str>,
}

/// Builds the message and returns it base64url encoded, ready for the
/// `raw` field of a Gmail send call.
pub fn compose_email(params: &ComposeEmailParams<'_>) -> String {
    let mut headers = Vec::with_capacity(8);
    match params.from_name.filter(|name| !name.trim().is_empty()) {
        Some(name) => headers.push(format!(
            "From: \"{}\" <{}>",
            header_value(name).replace('"', "'"),
            header_value(params.from)
        )),
        None => headers.push(format!("From: {}", header_value(params.from))),
    }
    headers.push(format!("To: {}", header_value(params.to)));
    headers.push(format!(
        "Subject: {}",
        encode_rfc2047(&header_value(params.subject))
    ));
    headers.push(format!("Date: {}", header_value(params.date)));
    headers.push("MIME-Version: 1.0".to_string());
    headers.push("Content-Type: text/html; charset=utf-8".to_string());
    if let Some(in_reply_to) = params.in_reply_to {
        headers.push(format!("In-Reply-To: {}", header_value(in_reply_to)));
    }
    if let Some(references) = params.references {
        headers.push(format!("References: {}", header_value(references)));
    }

    let mut body = params.body.to_string();
    if let Some(signature) = params.signature.filter(|value| !value.trim().is_empty()) {
        body.push_str("\n<br><br>--<br>\n");
        body.push_str(&text_to_html(signature));
    }
    if let Some(link) = params.unsubscribe_link {
        body.push_str("\n<br><br>\n");
        body.push_str(link);
    }

    let raw = format!("{}\r\n\r\n{}", headers.join("\r\n"), body);
    URL_SAFE_NO_PAD.encode(raw.as_bytes())
}

fn header_value(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

/// Encoded-word form for non-ASCII header text; ASCII passes through.
pub fn encode_rfc2047(text: &str) -> String {
    if text.is_ascii() {
        return text.to_string();
    }
    format!("=?UTF-8?B?{}?=", STANDARD.encode(text.as_bytes()))
}

pub fn text_to_html(text: &str) -> String {
    text.replace("\r\n", "<br>")
        .replace('\n', "<br>")
        .replace('\r', "<br>")
}

/// Subject for a follow-up in the same thread.
pub fn threaded_subject(subject: &str) -> String {
    if RE_PREFIX.is_match(subject) {
        subject.to_string()
    } else {
        format!("Re: {}", subject)
    }
}

pub fn unsubscribe_link(base_url: &str, prospect_id: &str, workspace_id: &str) -> String {
    let url = format!(
        "{}/api/unsubscribe?p={}&w={}",
        base_url.trim_end_matches('/'),
        prospect_id,
        workspace_id
    );
    format!(
        "<p style=\"color: #6b7280; font-size: 12px; margin-top: 20px;\">\n    <a href=\"{}\" style=\"color: #6b7280;\">Unsubscribe</a>\n</p>",
        url
    )
}

/// Prospect fields available to subject and body templates.
#[derive(Debug, Clone, Default)]
pub struct TemplateVariables<'a> {
    pub first_name: Option<&'a str>,
    pub last_name: Option<&'a str>,
    pub company: Option<&'a str>,
    pub title: Option<&'a str>,
    pub email: Option<&'a str>,
}

impl<'a> TemplateVariables<'a> {
    fn lookup(&self, name: &str) -> Option<Option<&'a str>> {
        match name {
            "first_name" => Some(self.first_name),
            "last_name" => Some(self.last_name),
            "company" => Some(self.company),
            "title" => Some(self.title),
            "email" => Some(self.email),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderedTemplate {
    pub text: String,
    pub missing_fields: Vec<String>,
    pub invalid_variables: Vec<String>,
}

/// Replaces `{{variable}}` placeholders. Missing values render empty and
/// unknown variables are left in place.
pub fn render_template(template: &str, variables: &TemplateVariables<'_>) -> RenderedTemplate {
    let mut missing_fields: Vec<String> = Vec::new();
    let mut invalid_variables: Vec<String> = Vec::new();
    let text = VARIABLE_PATTERN
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            match variables.lookup(&name.to_ascii_lowercase()) {
                None => {
                    if !invalid_variables.iter().any(|known| known == name) {
                        invalid_variables.push(name.to_string());
                    }
                    caps[0].to_string()
                }
                Some(value) => match value.filter(|value| !value.is_empty()) {
                    Some(value) => value.to_string(),
                    None => {
                        if !missing_fields.iter().any(|known| known == name) {
                            missing_fields.push(name.to_string());
                        }
                        String::new()
                    }
                },
            }
        })
        .into_owned();
    RenderedTemplate {
        text,
        missing_fields,
        invalid_variables,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(raw: &str) -> String {
        String::from_utf8(URL_SAFE_NO_PAD.decode(raw).expect("base64url")).expect("utf8")
    }

    #[test]
    fn compose_email_builds_threaded_message() {
        let raw = compose_email(&ComposeEmailParams {
            from: "sales@acme.test",
            from_name: Some("Ada from Acme"),
            to: "marie@prospect.test",
            subject: "Re: Quick question",
            body: "<p>Hello Marie</p>",
            date: "Tue, 13 Oct 2026 09:00:00 +0000",
            in_reply_to: Some("<abc@mail.gmail.com>"),
            references: Some("<abc@mail.gmail.com>"),
            signature: Some("Ada\nAcme"),
            unsubscribe_link: None,
        });
        assert!(!raw.contains('='));
        assert!(!raw.contains('+'));
        let message = decode(&raw);
        assert!(message.starts_with("From: \"Ada from Acme\" <sales@acme.test>\r\n"));
        assert!(message.contains("\r\nIn-Reply-To: <abc@mail.gmail.com>\r\n"));
        assert!(message.contains("\r\nReferences: <abc@mail.gmail.com>"));
        assert!(message.contains("\r\n\r\n<p>Hello Marie</p>\n<br><br>--<br>\nAda<br>Acme"));
    }

    #[test]
    fn compose_email_strips_header_line_breaks() {
        let raw = compose_email(&ComposeEmailParams {
            from: "sales@acme.test",
            to: "marie@prospect.test",
            subject: "Hi\r\nBcc: victim@evil.test",
            body: "body",
            date: "Tue, 13 Oct 2026 09:00:00 +0000",
            ..Default::default()
        });
        let message = decode(&raw);
        assert!(message.contains("Subject: Hi  Bcc: victim@evil.test\r\n"));
        assert!(!message.contains("\r\nBcc:"));
    }

    #[test]
    fn non_ascii_subject_is_encoded() {
        assert_eq!(encode_rfc2047("Hello"), "Hello");
        assert_eq!(encode_rfc2047("Café"), "=?UTF-8?B?Q2Fmw6k=?=");
    }

    #[test]
    fn threaded_subject_adds_prefix_once() {
        assert_eq!(threaded_subject("Quick question"), "Re: Quick question");
        assert_eq!(threaded_subject("RE: Quick question"), "RE: Quick question");
    }

    #[test]
    fn render_template_substitutes_known_variables() {
        let variables = TemplateVariables {
            first_name: Some("Marie"),
            company: None,
            ..Default::default()
        };
        let rendered = render_template(
            "Hi {{First_Name}}, how is {{company}}? {{unknown_thing}}",
            &variables,
        );
        assert_eq!(rendered.text, "Hi Marie, how is ? {{unknown_thing}}");
        assert_eq!(rendered.missing_fields, vec!["company".to_string()]);
        assert_eq!(rendered.invalid_variables, vec!["unknown_thing".to_string()]);
    }

    #[test]
    fn unsubscribe_link_points_at_app() {
        let link = unsubscribe_link("https://app.acme.test/", "p-1", "w-1");
        assert!(link.contains("https://app.acme.test/api/unsubscribe?p=p-1&w=w-1"));
    }
}
