/// HTTP verb used to list a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    /// Search endpoints taking an (empty) JSON body
    Post,
}

/// Where a kind of record lives on its backend and how to unwrap it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resource {
    /// Short name for logs
    pub name: &'static str,
    /// Listing path, relative to the backend base URL
    pub path: &'static str,
    pub method: Method,
    /// Key of the array in the listing response; `None` for a bare array
    pub envelope: Option<&'static str>,
    /// Field holding the record id
    pub id_field: &'static str,
    /// Path of a single record, `{item_path}/{id}`. Without one, `get` is a
    /// filtered listing on the id field.
    pub item_path: Option<&'static str>,
    /// Key wrapping a single record in the item response
    pub item_envelope: Option<&'static str>,
    /// Query parameters sent with every listing
    pub default_query: &'static [(&'static str, &'static str)],
}

impl Resource {
    pub const IRONIC_NODES: Resource = Resource {
        name: "ironic nodes",
        path: "v1/nodes/detail",
        method: Method::Get,
        envelope: Some("nodes"),
        id_field: "uuid",
        item_path: Some("v1/nodes"),
        item_envelope: None,
        default_query: &[],
    };

    pub const IRONIC_PORTS: Resource = Resource {
        name: "ironic ports",
        path: "v1/ports/detail",
        method: Method::Get,
        envelope: Some("ports"),
        id_field: "uuid",
        item_path: Some("v1/ports"),
        item_envelope: None,
        default_query: &[],
    };

    pub const NOVA_AGGREGATES: Resource = Resource {
        name: "nova aggregates",
        path: "os-aggregates",
        method: Method::Get,
        envelope: Some("aggregates"),
        id_field: "id",
        item_path: Some("os-aggregates"),
        item_envelope: Some("aggregate"),
        default_query: &[],
    };

    pub const NOVA_SERVERS: Resource = Resource {
        name: "nova servers",
        path: "servers/detail",
        method: Method::Get,
        envelope: Some("servers"),
        id_field: "id",
        item_path: Some("servers"),
        item_envelope: Some("server"),
        default_query: &[("all_tenants", "True")],
    };

    pub const KEYSTONE_PROJECTS: Resource = Resource {
        name: "keystone projects",
        path: "v3/projects",
        method: Method::Get,
        envelope: Some("projects"),
        id_field: "id",
        item_path: Some("v3/projects"),
        item_envelope: Some("project"),
        default_query: &[],
    };

    pub const BLAZAR_HOSTS: Resource = Resource {
        name: "blazar hosts",
        path: "os-hosts",
        method: Method::Get,
        envelope: Some("hosts"),
        id_field: "id",
        item_path: Some("os-hosts"),
        item_envelope: Some("host"),
        default_query: &[("detail", "True")],
    };

    pub const GNOCCHI_CUDA_RESOURCES: Resource = Resource {
        name: "gnocchi cuda resources",
        path: "v1/search/resource/cuda",
        method: Method::Post,
        envelope: None,
        id_field: "id",
        item_path: Some("v1/resource/cuda"),
        item_envelope: None,
        default_query: &[],
    };

    pub const CORSA_PORT_STATS: Resource = Resource {
        name: "corsa port stats",
        path: "api/v1/stats/ports",
        method: Method::Get,
        envelope: Some("stats"),
        id_field: "port",
        item_path: None,
        item_envelope: None,
        default_query: &[],
    };
}
