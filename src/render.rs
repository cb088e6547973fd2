use crate::site::Story;

const SITEMAP_HEADER: &str = concat!(
    r#"<?xml version="1.0" encoding="UTF-8"?>"#,
    r#"<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9" "#,
    r#"xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" "#,
    r#"xsi:schemaLocation="http://www.sitemaps.org/schemas/sitemap/0.9 "#,
    r#"http://www.sitemaps.org/schemas/sitemap/0.9/sitemap.xsd">"#,
);

/// Renders the sitemap with one `<url>` per story, in payload order.
pub fn render_sitemap(stories: &[Story]) -> String {
    let mut out = String::from(SITEMAP_HEADER);
    for story in stories {
        out.push_str(&render_sitemap_entry(story));
    }
    out.push_str("</urlset>");
    out
}

pub fn render_sitemap_entry(story: &Story) -> String {
    format!(
        "<url><loc>{}</loc><lastmod>{}+00:00</lastmod><priority>{}</priority></url>",
        escape_xml(&story.canonical_url),
        lastmod(&story.updated_at),
        priority(story)
    )
}

fn priority(story: &Story) -> &'static str {
    if story.anchor == "index" {
        "1"
    } else {
        "0.8"
    }
}

// Whole-second prefix of an ISO-8601 timestamp: "YYYY-MM-DDTHH:MM:SS".
fn lastmod(updated_at: &str) -> &str {
    match updated_at.char_indices().nth(19) {
        Some((idx, _)) => &updated_at[..idx],
        None => updated_at,
    }
}

fn escape_xml(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(ch),
        }
    }
    out
}
