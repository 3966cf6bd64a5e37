use scraper::{ElementRef, Html, Selector};

/// Compile a selector known at build time.
pub fn sel(css: &str) -> Selector {
    Selector::parse(css).unwrap_or_else(|e| panic!("invalid static selector {css:?}: {e:?}"))
}

/// Collapse runs of whitespace into single spaces and trim.
pub fn normalize_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Visible text of an element, whitespace-normalized.
pub fn text_of(el: ElementRef<'_>) -> String {
    normalize_ws(&el.text().collect::<Vec<_>>().join(" "))
}

/// Whole-document text, lowercased, for keyword checks.
pub fn body_text_lc(doc: &Html) -> String {
    let body = sel("body");
    let text = match doc.select(&body).next() {
        Some(b) => text_of(b),
        None => text_of(doc.root_element()),
    };
    text.to_lowercase()
}

/// Nearest ancestor element with one of the given tag names.
pub fn closest<'a>(el: ElementRef<'a>, tags: &[&str]) -> Option<ElementRef<'a>> {
    el.ancestors()
        .filter_map(ElementRef::wrap)
        .find(|a| tags.contains(&a.value().name()))
}

/// Direct child elements named `tag`.
pub fn children_named<'a>(el: ElementRef<'a>, tag: &str) -> Vec<ElementRef<'a>> {
    el.children()
        .filter_map(ElementRef::wrap)
        .filter(|c| c.value().name() == tag)
        .collect()
}

pub fn has_class(el: ElementRef<'_>, class: &str) -> bool {
    el.value()
        .attr("class")
        .map(|c| c.split_whitespace().any(|x| x.eq_ignore_ascii_case(class)))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_is_whitespace_normalized() {
        let doc = Html::parse_fragment("<p>  R$\n   120,00 <b>pago</b> </p>");
        let p = doc.select(&sel("p")).next().unwrap();
        assert_eq!(text_of(p), "R$ 120,00 pago");
    }

    #[test]
    fn closest_walks_up_to_row() {
        let doc = Html::parse_document(
            "<table><tbody><tr id='r'><td><input id='c'></td></tr></tbody></table>",
        );
        let input = doc.select(&sel("#c")).next().unwrap();
        let row = closest(input, &["tr"]).unwrap();
        assert_eq!(row.value().attr("id"), Some("r"));
        assert_eq!(children_named(row, "td").len(), 1);
    }
}
