// Copyright (c) 2019 Emmanuel Gil Peyrot <linkmauve@linkmauve.fr>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use minidom::Element;

use crate::error::ProtocolError;
use crate::ns;

/// Parsed `<stream:features/>` advertisement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Features {
    /// STARTTLS is offered.
    pub starttls: bool,

    /// STARTTLS is offered and marked `<required/>`.
    pub starttls_required: bool,

    /// Offered SASL mechanisms, in server order.
    pub mechanisms: Vec<String>,

    /// Resource binding is offered.
    pub bind: bool,

    /// The legacy session feature is offered without `<optional/>`.
    pub session_required: bool,

    /// XEP-0198 stream management is offered.
    pub stream_management: bool,

    /// Any other advertised features, as (name, namespace).
    pub others: Vec<(String, String)>,
}

impl Features {
    /// Whether the server wants to see STARTTLS before anything else.
    pub fn can_starttls(&self) -> bool {
        self.starttls
    }

    /// Whether SASL authentication is offered.
    pub fn can_authenticate(&self) -> bool {
        !self.mechanisms.is_empty()
    }

    /// Whether resource binding is offered.
    pub fn can_bind(&self) -> bool {
        self.bind
    }
}

impl TryFrom<&Element> for Features {
    type Error = ProtocolError;

    fn try_from(elem: &Element) -> Result<Self, ProtocolError> {
        if !elem.is("features", ns::STREAM) {
            return Err(ProtocolError::UnexpectedElement {
                name: elem.name().to_owned(),
                ns: elem.ns(),
            });
        }
        let mut features = Features::default();
        for child in elem.children() {
            if child.is("starttls", ns::TLS) {
                features.starttls = true;
                features.starttls_required = child.has_child("required", ns::TLS);
            } else if child.is("mechanisms", ns::SASL) {
                features.mechanisms = child
                    .children()
                    .filter(|m| m.is("mechanism", ns::SASL))
                    .map(|m| m.text().trim().to_owned())
                    .collect();
            } else if child.is("bind", ns::BIND) {
                features.bind = true;
            } else if child.is("session", ns::SESSION) {
                features.session_required = !child.has_child("optional", ns::SESSION);
            } else if child.is("sm", ns::SM) {
                features.stream_management = true;
            } else {
                features
                    .others
                    .push((child.name().to_owned(), child.ns()));
            }
        }
        Ok(features)
    }
}
