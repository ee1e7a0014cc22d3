use crate::parser::ast::*;

macro_rules! trim_right_previous {
    ($vec: expr) => {
        if let Some(last) = $vec.pop() {
            if let Node::Data(pos, mut s) = last {
                s = s.trim_end().to_string();
                if !s.is_empty() {
                    $vec.push(Node::Data(pos, s));
                }
            } else {
                $vec.push(last);
            }
        }
    };
    ($cond: expr, $vec: expr) => {
        if $cond {
            trim_right_previous!($vec);
        }
    };
}

/// Removes whitespace from the AST nodes according to the `{%-` and `-%}`
/// defined in the template. Empty data nodes are discarded.
///
/// The `body_ws` param is used when recursing through nested bodies:
/// - the initial `trim_left_next` is `ws.left`
/// - the last data node is right-trimmed if `ws.right == true`
pub fn remove_whitespace(nodes: Vec<Node>, body_ws: Option<WS>) -> Vec<Node> {
    let mut res = Vec::with_capacity(nodes.len());

    // Whether the node we just added to res is a data node
    let mut previous_was_text = false;
    // Whether the previous tag ended with `-%}` so the next data node
    // needs a left trim
    let mut trim_left_next = body_ws.map_or(false, |ws| ws.left);

    for n in nodes {
        match n {
            Node::Data(pos, s) => {
                previous_was_text = true;

                if !trim_left_next {
                    res.push(Node::Data(pos, s));
                    continue;
                }
                trim_left_next = false;

                let new_val = s.trim_start();
                if !new_val.is_empty() {
                    res.push(Node::Data(pos, new_val.to_string()));
                }
                // empty data nodes are skipped
                continue;
            }
            Node::Output(ws, _)
            | Node::Set(ws, _)
            | Node::Extends(ws, _, _)
            | Node::Include(ws, _)
            | Node::Import(ws, _)
            | Node::FromImport(ws, _)
            | Node::Do(ws, _)
            | Node::Break(ws, _)
            | Node::Continue(ws, _)
            | Node::Comment(ws, _) => {
                trim_right_previous!(previous_was_text && ws.left, res);
                trim_left_next = ws.right;
            }
            Node::Raw(start_ws, pos, ref s, end_ws) => {
                trim_right_previous!(previous_was_text && start_ws.left, res);
                previous_was_text = false;
                trim_left_next = end_ws.right;

                if start_ws.right || end_ws.left {
                    let val = if start_ws.right && end_ws.left {
                        s.trim()
                    } else if start_ws.right {
                        s.trim_start()
                    } else {
                        s.trim_end()
                    };
                    res.push(Node::Raw(start_ws, pos, val.to_string(), end_ws));
                    continue;
                }
            }
            // Nodes with one body surrounded by two tags
            Node::Forloop(start_ws, _, end_ws)
            | Node::While(start_ws, _, end_ws)
            | Node::Match(start_ws, _, end_ws)
            | Node::Block(start_ws, _, end_ws)
            | Node::With(start_ws, _, end_ws)
            | Node::MacroDefinition(start_ws, _, end_ws)
            | Node::CallBlock(start_ws, _, end_ws)
            | Node::Capture(start_ws, _, end_ws)
            | Node::Cache(start_ws, _, end_ws)
            | Node::FilterSection(start_ws, _, end_ws)
            | Node::Slot(start_ws, _, end_ws)
            | Node::Embed(start_ws, _, end_ws)
            | Node::Spaceless(start_ws, _, end_ws) => {
                trim_right_previous!(previous_was_text && start_ws.left, res);
                previous_was_text = false;
                trim_left_next = end_ws.right;

                let body_ws = WS { left: start_ws.right, right: end_ws.left };
                match n {
                    Node::Forloop(_, mut forloop, _) => {
                        if let Some(empty) = forloop.empty_body {
                            forloop.body = remove_whitespace(
                                forloop.body,
                                Some(WS { left: body_ws.left, right: false }),
                            );
                            forloop.empty_body = Some(remove_whitespace(
                                empty,
                                Some(WS { left: false, right: body_ws.right }),
                            ));
                        } else {
                            forloop.body = remove_whitespace(forloop.body, Some(body_ws));
                        }
                        res.push(Node::Forloop(start_ws, forloop, end_ws));
                    }
                    Node::While(_, mut while_loop, _) => {
                        while_loop.body = remove_whitespace(while_loop.body, Some(body_ws));
                        res.push(Node::While(start_ws, while_loop, end_ws));
                    }
                    Node::Match(_, mut match_block, _) => {
                        let last = match_block.cases.len().saturating_sub(1);
                        match_block.cases = match_block
                            .cases
                            .into_iter()
                            .enumerate()
                            .map(|(i, mut case)| {
                                let right = i == last && body_ws.right;
                                case.body = remove_whitespace(
                                    case.body,
                                    Some(WS { left: false, right }),
                                );
                                case
                            })
                            .collect();
                        res.push(Node::Match(start_ws, match_block, end_ws));
                    }
                    Node::Block(_, mut block, _) => {
                        block.body = remove_whitespace(block.body, Some(body_ws));
                        res.push(Node::Block(start_ws, block, end_ws));
                    }
                    Node::With(_, mut with, _) => {
                        with.body = remove_whitespace(with.body, Some(body_ws));
                        res.push(Node::With(start_ws, with, end_ws));
                    }
                    Node::MacroDefinition(_, mut macro_def, _) => {
                        macro_def.body = remove_whitespace(macro_def.body, Some(body_ws));
                        res.push(Node::MacroDefinition(start_ws, macro_def, end_ws));
                    }
                    Node::CallBlock(_, mut call_block, _) => {
                        call_block.body = remove_whitespace(call_block.body, Some(body_ws));
                        res.push(Node::CallBlock(start_ws, call_block, end_ws));
                    }
                    Node::Capture(_, mut capture, _) => {
                        capture.body = remove_whitespace(capture.body, Some(body_ws));
                        res.push(Node::Capture(start_ws, capture, end_ws));
                    }
                    Node::Cache(_, mut cache, _) => {
                        cache.body = remove_whitespace(cache.body, Some(body_ws));
                        res.push(Node::Cache(start_ws, cache, end_ws));
                    }
                    Node::FilterSection(_, mut filter_section, _) => {
                        filter_section.body =
                            remove_whitespace(filter_section.body, Some(body_ws));
                        res.push(Node::FilterSection(start_ws, filter_section, end_ws));
                    }
                    Node::Slot(_, mut slot, _) => {
                        slot.default_body = remove_whitespace(slot.default_body, Some(body_ws));
                        res.push(Node::Slot(start_ws, slot, end_ws));
                    }
                    Node::Embed(_, mut embed, _) => {
                        embed.body = remove_whitespace(embed.body, Some(body_ws));
                        res.push(Node::Embed(start_ws, embed, end_ws));
                    }
                    Node::Spaceless(_, body, _) => {
                        res.push(Node::Spaceless(
                            start_ws,
                            remove_whitespace(body, Some(body_ws)),
                            end_ws,
                        ));
                    }
                    _ => unreachable!("bodied node list out of sync"),
                };
                continue;
            }
            // The ugly one
            Node::If(If { conditions, otherwise }, end_ws) => {
                trim_left_next = end_ws.right;
                let mut new_conditions: Vec<(_, _, Vec<_>)> = Vec::with_capacity(conditions.len());

                for mut condition in conditions {
                    if condition.0.left {
                        // trim the data node before the if/elif tag
                        if new_conditions.is_empty() && previous_was_text {
                            trim_right_previous!(res);
                        } else if let Some(&mut (_, _, ref mut body)) = new_conditions.last_mut() {
                            trim_right_previous!(body);
                        }
                    }

                    // the right side is found out at the next iteration
                    condition.2 = remove_whitespace(
                        condition.2,
                        Some(WS { left: condition.0.right, right: false }),
                    );
                    new_conditions.push(condition);
                }

                previous_was_text = false;

                if let Some((else_ws, body)) = otherwise {
                    if else_ws.left {
                        if let Some(&mut (_, _, ref mut body)) = new_conditions.last_mut() {
                            trim_right_previous!(body);
                        }
                    }
                    let mut else_body =
                        remove_whitespace(body, Some(WS { left: else_ws.right, right: false }));
                    if end_ws.left {
                        trim_right_previous!(else_body);
                    }
                    res.push(Node::If(
                        If { conditions: new_conditions, otherwise: Some((else_ws, else_body)) },
                        end_ws,
                    ));
                    continue;
                }

                if end_ws.left {
                    if let Some(&mut (_, _, ref mut body)) = new_conditions.last_mut() {
                        trim_right_previous!(true, body);
                    }
                }

                res.push(Node::If(If { conditions: new_conditions, otherwise }, end_ws));
                continue;
            }
            Node::Super | Node::Emit(..) => (),
        };

        // Not a data node and nothing to change on the node itself
        previous_was_text = false;
        res.push(n);
    }

    if let Some(whitespace) = body_ws {
        trim_right_previous!(whitespace.right, res);
    }

    res
}
