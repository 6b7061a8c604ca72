use std::io::Error;

use html5ever::driver::ParseOpts;
use html5ever::parse_document;
use html5ever::tendril::TendrilSink;
use html5ever::tree_builder::TreeBuilderOpts;
use markup5ever_rcdom::{Handle, NodeData, RcDom};

const HTML_NAMESPACE: &str = "http://www.w3.org/1999/xhtml";

#[derive(Debug, Clone, PartialEq)]
pub enum FormElement {
  Input {
    name: Option<String>,
    id: Option<String>,
    value: Option<String>,
  },
}

/// Depth-first walk over a DOM subtree, in document order, starting with the
/// node itself.
pub struct IterNodes {
  stack: Vec<Handle>,
}

impl IterNodes {
  pub fn from(node: &Handle) -> Self {
    IterNodes {
      stack: vec![node.clone()],
    }
  }
}

impl Iterator for IterNodes {
  type Item = Handle;
  fn next(&mut self) -> Option<Self::Item> {
    let node = self.stack.pop()?;
    self
      .stack
      .extend(node.children.borrow().iter().rev().cloned());
    Some(node)
  }
}

pub fn get_attr(node: &Handle, name: &str) -> Option<String> {
  match node.data {
    NodeData::Element { ref attrs, .. } => attrs
      .borrow()
      .iter()
      .find(|attr| attr.name.ns.is_empty() && &*attr.name.local == name)
      .map(|attr| attr.value.to_string()),
    _ => None,
  }
}

pub fn get_node_name(node: &Handle) -> Option<String> {
  match node.data {
    NodeData::Element { ref name, .. } if &*name.ns == HTML_NAMESPACE => Some(name.local.to_lowercase()),
    _ => None,
  }
}

fn has_class(node: &Handle, class: &str) -> bool {
  get_attr(node, "class")
    .map(|classes| classes.split_whitespace().any(|c| c == class))
    .unwrap_or(false)
}

pub fn find_inputs(node: &Handle) -> Vec<FormElement> {
  IterNodes::from(node)
    .filter(|node| get_node_name(node).as_deref() == Some("input"))
    .map(|node| FormElement::Input {
      name: get_attr(&node, "name"),
      id: get_attr(&node, "id"),
      value: get_attr(&node, "value"),
    })
    .collect()
}

pub fn find_forms(node: &Handle) -> Vec<Handle> {
  IterNodes::from(node)
    .filter(|node| get_node_name(node).as_deref() == Some("form"))
    .collect()
}

/// The value of the first input inside any form whose name or id is `key`.
pub fn find_form_value(doc: &Handle, key: &str) -> Option<String> {
  find_forms(doc)
    .iter()
    .flat_map(|form| find_inputs(form))
    .filter_map(|elm| match elm {
      FormElement::Input { name, id, value } => {
        if name.as_deref() == Some(key) || id.as_deref() == Some(key) {
          Some(value.unwrap_or_default())
        } else {
          None
        }
      }
    })
    .next()
}

/// Whitespace-normalised text of every element carrying `class`.
pub fn find_text_by_class(doc: &Handle, class: &str) -> Vec<String> {
  IterNodes::from(doc)
    .filter(|node| has_class(node, class))
    .map(|node| text_content(&node))
    .filter(|text| !text.is_empty())
    .collect()
}

fn text_content(node: &Handle) -> String {
  let mut raw = String::new();
  for n in IterNodes::from(node) {
    if let NodeData::Text { ref contents } = n.data {
      raw.push_str(&contents.borrow());
      raw.push(' ');
    }
  }
  raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn parse_dom(content: String) -> Result<Handle, Error> {
  let opts = ParseOpts {
    tree_builder: TreeBuilderOpts {
      drop_doctype: true,
      ..Default::default()
    },
    ..Default::default()
  };
  let mut data: &[u8] = content.as_bytes();
  parse_document(RcDom::default(), opts)
    .from_utf8()
    .read_from(&mut data)
    .map(|dom| dom.document)
}
