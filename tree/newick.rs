//! Newick reader.
//!
//! Tips are numbered in order of appearance and internal nodes in post-order, so
//! the root is always the last node. Heights are derived from branch lengths with
//! the most distant tip placed at height zero; missing lengths count as zero.
//! Bracketed comments are skipped and internal labels are ignored.

use super::{Tree, TreeError};

struct PendingNode {
    parent: Option<usize>,
    children: Vec<usize>,
    name: Option<String>,
    length: f64,
}

pub fn parse(text: &str) -> Result<Tree, TreeError> {
    let bytes = text.as_bytes();
    let mut nodes: Vec<PendingNode> = Vec::new();
    let mut open: Vec<usize> = Vec::new();
    let mut current: Option<usize> = None;
    let mut pos = 0;
    let mut finished = false;

    let fail = |position: usize, message: &str| TreeError::Newick {
        position,
        message: message.to_string(),
    };

    while pos < bytes.len() {
        let c = bytes[pos];
        match c {
            b'(' => {
                let parent = open.last().copied();
                if parent.is_none() && !nodes.is_empty() {
                    return Err(fail(pos, "unexpected '(' after the tree closed"));
                }
                let id = push_node(&mut nodes, parent, None);
                open.push(id);
                current = None;
                pos += 1;
            }
            b',' => {
                if open.is_empty() {
                    return Err(fail(pos, "',' outside of any clade"));
                }
                current = None;
                pos += 1;
            }
            b')' => {
                let id = open.pop().ok_or_else(|| fail(pos, "unbalanced ')'"))?;
                current = Some(id);
                pos += 1;
            }
            b':' => {
                let target = current.ok_or_else(|| fail(pos, "branch length without a node"))?;
                let start = pos + 1;
                let mut end = start;
                while end < bytes.len() && is_number_byte(bytes[end]) {
                    end += 1;
                }
                let literal = text[start..end].trim();
                let length: f64 = literal
                    .parse()
                    .map_err(|_| fail(start, &format!("invalid branch length '{literal}'")))?;
                nodes[target].length = length;
                pos = end;
            }
            b';' => {
                finished = true;
                break;
            }
            b'[' => {
                let close = text[pos..]
                    .find(']')
                    .ok_or_else(|| fail(pos, "unterminated comment"))?;
                pos += close + 1;
            }
            c if c.is_ascii_whitespace() => pos += 1,
            _ => {
                let (label, next) = read_label(text, pos)?;
                match current {
                    // Label after ')' names an internal node; ignored.
                    Some(_) => {}
                    None => {
                        let parent = open.last().copied();
                        if parent.is_none() && !nodes.is_empty() {
                            return Err(fail(pos, "label outside of the tree"));
                        }
                        let id = push_node(&mut nodes, parent, Some(label));
                        current = Some(id);
                    }
                }
                pos = next;
            }
        }
    }

    if !finished {
        return Err(fail(bytes.len(), "missing terminating ';'"));
    }
    if !open.is_empty() {
        return Err(fail(pos, "unbalanced '('"));
    }
    if nodes.is_empty() {
        return Err(fail(0, "empty tree"));
    }
    assemble(nodes)
}

fn push_node(nodes: &mut Vec<PendingNode>, parent: Option<usize>, name: Option<String>) -> usize {
    let id = nodes.len();
    nodes.push(PendingNode {
        parent,
        children: Vec::new(),
        name,
        length: 0.0,
    });
    if let Some(p) = parent {
        nodes[p].children.push(id);
    }
    id
}

fn is_number_byte(b: u8) -> bool {
    b.is_ascii_digit() || matches!(b, b'.' | b'-' | b'+' | b'e' | b'E') || b == b' '
}

fn read_label(text: &str, start: usize) -> Result<(String, usize), TreeError> {
    let bytes = text.as_bytes();
    if bytes[start] == b'\'' || bytes[start] == b'"' {
        let quote = bytes[start] as char;
        let close = text[start + 1..]
            .find(quote)
            .ok_or_else(|| TreeError::Newick {
                position: start,
                message: "unterminated quoted label".to_string(),
            })?;
        let label = text[start + 1..start + 1 + close].to_string();
        return Ok((label, start + close + 2));
    }
    let mut end = start;
    while end < bytes.len() && !matches!(bytes[end], b'(' | b')' | b',' | b':' | b';' | b'[') {
        end += 1;
    }
    Ok((text[start..end].trim().to_string(), end))
}

fn assemble(nodes: Vec<PendingNode>) -> Result<Tree, TreeError> {
    let root = 0;

    // Post-order over the pending nodes.
    let mut order = Vec::with_capacity(nodes.len());
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        order.push(node);
        stack.extend(nodes[node].children.iter().copied());
    }
    order.reverse();

    let tips: Vec<usize> = (0..nodes.len())
        .filter(|&n| nodes[n].children.is_empty())
        .collect();
    let tip_count = tips.len();
    let mut index = vec![0; nodes.len()];
    let mut tip_names = Vec::with_capacity(tip_count);
    for (i, &tip) in tips.iter().enumerate() {
        index[tip] = i;
        tip_names.push(nodes[tip].name.clone().unwrap_or_else(|| format!("t{i}")));
    }
    let mut next = tip_count;
    for &node in &order {
        if !nodes[node].children.is_empty() {
            index[node] = next;
            next += 1;
        }
    }

    // Depth from the root, accumulated top-down.
    let mut depth = vec![0.0; nodes.len()];
    for &node in order.iter().rev() {
        if let Some(parent) = nodes[node].parent {
            depth[node] = depth[parent] + nodes[node].length;
        }
    }
    let max_depth = tips.iter().map(|&t| depth[t]).fold(0.0_f64, f64::max);

    let mut parents = vec![None; nodes.len()];
    let mut heights = vec![0.0; nodes.len()];
    for (node, pending) in nodes.iter().enumerate() {
        parents[index[node]] = pending.parent.map(|p| index[p]);
        heights[index[node]] = (max_depth - depth[node]).max(0.0);
    }
    Tree::from_parents(parents, heights, tip_names)
}
