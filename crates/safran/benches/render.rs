//! Benchmarks for the template engine
//!
//! Run with: cargo bench --bench render
//!
//! Benchmarks cover:
//! - Lexing (tokenization)
//! - Parsing (AST generation)
//! - Full render (parse + evaluate)
//! - Render of a pre-parsed template

use divan::black_box;
use safran::lexer::Lexer;
use safran::token::TokenKind;
use safran::{Environment, LexerConfig};
use serde_json::{json, Value};

fn main() {
    divan::main();
}

// ============================================================================
// Template generators
// ============================================================================

/// Simple template with just text
fn simple_text() -> &'static str {
    "Hello, World! This is a simple static text template."
}

/// Template with variable interpolation
fn with_variables() -> &'static str {
    r#"Hello, {{ name }}! Welcome to {{ site_name }}.
Your account was created on {{ created_date }}.
You have {{ message_count }} unread messages."#
}

/// Template with loops and conditionals
fn with_control_flow() -> &'static str {
    r#"<ul>
{% for item in items %}
  <li{% if item.featured %} class="featured"{% endif %}>{{ item.name }}: {{ item.price }}</li>
{% endfor %}
</ul>"#
}

/// Complex realistic template (like a page layout)
fn complex_template() -> &'static str {
    r#"<!DOCTYPE html>
<html>
<head>
    <title>{{ page.title }} - {{ site.name }}</title>
</head>
<body>
    <nav>
        {% for link in nav_links %}
        <a href="{{ link.url }}"{% if link.active %} class="active"{% endif %}>{{ link.label }}</a>
        {% endfor %}
    </nav>
    <main>
        <h1>{{ page.title }}</h1>
        {% if page.author %}<p>by {{ upper(page.author) }}</p>{% endif %}
        {% for section in page.sections %}
        <section>
            <h2>{{ loop.index1 }}. {{ section.heading }}</h2>
            <p>{{ section.body }}</p>
        </section>
        {% endfor %}
    </main>
</body>
</html>"#
}

fn variables_data() -> Value {
    json!({
        "name": "Alice",
        "site_name": "example.org",
        "created_date": "2021-06-01",
        "message_count": 4,
    })
}

fn control_flow_data() -> Value {
    json!({
        "items": (0..20).map(|i| json!({
            "name": format!("item-{i}"),
            "price": i * 10,
            "featured": i % 5 == 0,
        })).collect::<Vec<_>>(),
    })
}

fn complex_data() -> Value {
    json!({
        "site": {"name": "example.org"},
        "page": {
            "title": "Benchmarks",
            "author": "alice",
            "sections": (0..10).map(|i| json!({
                "heading": format!("Section {i}"),
                "body": "Lorem ipsum dolor sit amet, consectetur adipiscing elit.",
            })).collect::<Vec<_>>(),
        },
        "nav_links": [
            {"url": "/", "label": "Home", "active": true},
            {"url": "/docs", "label": "Docs", "active": false},
            {"url": "/about", "label": "About", "active": false},
        ],
    })
}

// ============================================================================
// Lexing
// ============================================================================

#[divan::bench]
fn lex_complex() {
    let config = LexerConfig::default();
    let source = complex_template();
    let mut lexer = Lexer::new(&config, black_box(source));
    loop {
        let token = lexer.next().unwrap();
        if token.kind == TokenKind::Eof {
            break;
        }
        black_box(token);
    }
}

// ============================================================================
// Parsing
// ============================================================================

#[divan::bench]
fn parse_simple() {
    let env = Environment::new();
    black_box(env.parse(black_box(simple_text())).unwrap());
}

#[divan::bench]
fn parse_complex() {
    let env = Environment::new();
    black_box(env.parse(black_box(complex_template())).unwrap());
}

// ============================================================================
// Rendering
// ============================================================================

#[divan::bench]
fn render_variables(bencher: divan::Bencher) {
    let env = Environment::new();
    let template = env.parse(with_variables()).unwrap();
    let data = variables_data();
    bencher.bench_local(|| black_box(env.render_template(&template, &data).unwrap()));
}

#[divan::bench]
fn render_control_flow(bencher: divan::Bencher) {
    let env = Environment::new();
    let template = env.parse(with_control_flow()).unwrap();
    let data = control_flow_data();
    bencher.bench_local(|| black_box(env.render_template(&template, &data).unwrap()));
}

#[divan::bench]
fn render_complex(bencher: divan::Bencher) {
    let env = Environment::new();
    let template = env.parse(complex_template()).unwrap();
    let data = complex_data();
    bencher.bench_local(|| black_box(env.render_template(&template, &data).unwrap()));
}

#[divan::bench]
fn parse_and_render_complex() {
    let env = Environment::new();
    let data = complex_data();
    black_box(env.render(black_box(complex_template()), &data).unwrap());
}
