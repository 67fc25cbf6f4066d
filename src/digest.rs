//! HTML body for a user's report: new finds grouped by artist.
use std::collections::BTreeMap;
use std::fmt::Write;

use crate::model::ReportedSku;

pub fn render(user_name: &str, skus: &[ReportedSku]) -> String {
    let mut by_artist: BTreeMap<&str, Vec<&ReportedSku>> = BTreeMap::new();
    for sku in skus {
        by_artist.entry(sku.artist.as_str()).or_default().push(sku);
    }

    let mut html = String::new();
    let _ = write!(
        html,
        "<html><body><p>Hi {},</p><p>We found {} new listing{} for artists you follow.</p>",
        escape(user_name),
        skus.len(),
        if skus.len() == 1 { "" } else { "s" }
    );
    for (artist, mut items) in by_artist {
        items.sort_by(|a, b| a.title.cmp(&b.title).then(a.sku_id.cmp(&b.sku_id)));
        let _ = write!(html, "<h2>{}</h2><table>", escape(artist));
        for s in items {
            let _ = write!(
                html,
                "<tr><td><img src=\"{img}\" width=\"96\" alt=\"\"></td>\
                 <td>{artist}</td>\
                 <td><a href=\"{item}\">{title}</a></td>\
                 <td><a href=\"{shop_url}\">{shop}</a></td>\
                 <td>{price}</td></tr>",
                img = escape(&s.image_url),
                artist = escape(&s.artist),
                item = escape(&s.item_url),
                title = escape(&s.title),
                shop_url = escape(&s.retailer_url),
                shop = escape(&s.retailer),
                price = escape(&s.price),
            );
        }
        html.push_str("</table>");
    }
    html.push_str("</body></html>");
    html
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
